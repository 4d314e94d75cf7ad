//! Query DSL
//!
//! The query language a partition store evaluates: typed leaf queries
//! mirroring the saved-filter operations, boolean composition, and a
//! small query-string language (`field:value`, quoted phrases, `+`/`-`
//! occurrence markers) parsed with nom.
//!
//! Queries are `compile`d once per search into a form with pre-built
//! regular expressions and token lists, then evaluated document at a
//! time. A match yields a term-frequency score; documents that do not
//! match yield nothing.

use crate::store::document::{tokenize, value_tokens, Document, FieldValue};
use chrono::{DateTime, Utc};
use nom::{
    branch::alt,
    bytes::complete::{take_while1, take_till},
    character::complete::{char, multispace0},
    combinator::opt,
    sequence::terminated,
    IResult,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by query validation and parsing.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query validation: {0}")]
    Validate(String),

    #[error("query string parse: {0}")]
    Parse(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),
}

/// A search query. An empty `field` on `Match`, `Term`, `Phrase`,
/// `Prefix`, `Wildcard` or `Regexp` means "any field".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Match {
        #[serde(default)]
        field: String,
        value: String,
    },
    Term {
        #[serde(default)]
        field: String,
        term: String,
    },
    Phrase {
        #[serde(default)]
        field: String,
        terms: Vec<String>,
    },
    Prefix {
        #[serde(default)]
        field: String,
        prefix: String,
    },
    Wildcard {
        #[serde(default)]
        field: String,
        wildcard: String,
    },
    Regexp {
        #[serde(default)]
        field: String,
        regexp: String,
    },
    DateRange {
        field: String,
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
    NumericRange {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    QueryString {
        query: String,
    },
    Conjunction {
        queries: Vec<Query>,
    },
    Disjunction {
        queries: Vec<Query>,
    },
    Boolean {
        #[serde(default)]
        must: Vec<Query>,
        #[serde(default)]
        should: Vec<Query>,
        #[serde(default)]
        must_not: Vec<Query>,
    },
    MatchAll,
}

impl Query {
    /// Validate without keeping the compiled form.
    pub fn validate(&self) -> Result<(), QueryError> {
        self.compile().map(|_| ())
    }

    /// AND `extra` onto an optional base query.
    pub fn conjoin(base: Option<Query>, extra: Query) -> Query {
        match base {
            None => extra,
            Some(Query::Conjunction { mut queries }) => {
                queries.push(extra);
                Query::Conjunction { queries }
            }
            Some(q) => Query::Conjunction {
                queries: vec![q, extra],
            },
        }
    }

    /// Compile into an evaluable query, validating along the way.
    pub fn compile(&self) -> Result<CompiledQuery, QueryError> {
        match self {
            Query::Match { field, value } => {
                let tokens = tokenize(value);
                if tokens.is_empty() {
                    return Err(QueryError::Validate("match value is empty".into()));
                }
                Ok(CompiledQuery::Match {
                    field: field.clone(),
                    tokens,
                })
            }
            Query::Term { field, term } => {
                if term.is_empty() {
                    return Err(QueryError::Validate("term is empty".into()));
                }
                Ok(CompiledQuery::Term {
                    field: field.clone(),
                    term: term.to_lowercase(),
                })
            }
            Query::Phrase { field, terms } => {
                let tokens: Vec<String> = terms
                    .iter()
                    .flat_map(|t| tokenize(t))
                    .collect();
                if tokens.is_empty() {
                    return Err(QueryError::Validate("phrase is empty".into()));
                }
                Ok(CompiledQuery::Phrase {
                    field: field.clone(),
                    tokens,
                })
            }
            Query::Prefix { field, prefix } => {
                if prefix.is_empty() {
                    return Err(QueryError::Validate("prefix is empty".into()));
                }
                Ok(CompiledQuery::Prefix {
                    field: field.clone(),
                    prefix: prefix.to_lowercase(),
                })
            }
            Query::Wildcard { field, wildcard } => {
                if wildcard.is_empty() {
                    return Err(QueryError::Validate("wildcard is empty".into()));
                }
                let re = wildcard_regex(wildcard)?;
                Ok(CompiledQuery::Pattern {
                    field: field.clone(),
                    re,
                })
            }
            Query::Regexp { field, regexp } => {
                if regexp.is_empty() {
                    return Err(QueryError::Validate("regexp is empty".into()));
                }
                let re = Regex::new(&format!("^(?:{})$", regexp))
                    .map_err(|e| QueryError::Pattern(e.to_string()))?;
                Ok(CompiledQuery::Pattern {
                    field: field.clone(),
                    re,
                })
            }
            Query::DateRange { field, start, end } => {
                if start.is_none() && end.is_none() {
                    return Err(QueryError::Validate(
                        "date range requires a start or an end".into(),
                    ));
                }
                if let (Some(s), Some(e)) = (start, end) {
                    if s > e {
                        return Err(QueryError::Validate(
                            "date range start is after end".into(),
                        ));
                    }
                }
                Ok(CompiledQuery::DateRange {
                    field: field.clone(),
                    start: *start,
                    end: *end,
                })
            }
            Query::NumericRange { field, min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(QueryError::Validate(
                        "numeric range requires a bound".into(),
                    ));
                }
                if let (Some(a), Some(b)) = (min, max) {
                    if a > b {
                        return Err(QueryError::Validate(
                            "numeric range min is above max".into(),
                        ));
                    }
                }
                Ok(CompiledQuery::NumericRange {
                    field: field.clone(),
                    min: *min,
                    max: *max,
                })
            }
            Query::QueryString { query } => parse_query_string(query)?.compile(),
            Query::Conjunction { queries } => {
                if queries.is_empty() {
                    return Err(QueryError::Validate("empty conjunction".into()));
                }
                let compiled = queries
                    .iter()
                    .map(|q| q.compile())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledQuery::Conjunction(compiled))
            }
            Query::Disjunction { queries } => {
                if queries.is_empty() {
                    return Err(QueryError::Validate("empty disjunction".into()));
                }
                let compiled = queries
                    .iter()
                    .map(|q| q.compile())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledQuery::Disjunction(compiled))
            }
            Query::Boolean {
                must,
                should,
                must_not,
            } => {
                if must.is_empty() && should.is_empty() && must_not.is_empty() {
                    return Err(QueryError::Validate("empty boolean query".into()));
                }
                Ok(CompiledQuery::Boolean {
                    must: must.iter().map(|q| q.compile()).collect::<Result<_, _>>()?,
                    should: should.iter().map(|q| q.compile()).collect::<Result<_, _>>()?,
                    must_not: must_not
                        .iter()
                        .map(|q| q.compile())
                        .collect::<Result<_, _>>()?,
                })
            }
            Query::MatchAll => Ok(CompiledQuery::MatchAll),
        }
    }
}

/// Translate a wildcard pattern (`*`, `?`) into an anchored regex.
fn wildcard_regex(pattern: &str) -> Result<Regex, QueryError> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| QueryError::Pattern(e.to_string()))
}

/// A validated, evaluable query.
#[derive(Debug, Clone)]
pub enum CompiledQuery {
    Match { field: String, tokens: Vec<String> },
    Term { field: String, term: String },
    Phrase { field: String, tokens: Vec<String> },
    Prefix { field: String, prefix: String },
    Pattern { field: String, re: Regex },
    DateRange {
        field: String,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    NumericRange {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Conjunction(Vec<CompiledQuery>),
    Disjunction(Vec<CompiledQuery>),
    Boolean {
        must: Vec<CompiledQuery>,
        should: Vec<CompiledQuery>,
        must_not: Vec<CompiledQuery>,
    },
    MatchAll,
}

/// Count occurrences of `token` in `field` ("" = any field).
fn token_count(doc: &Document, field: &str, token: &str) -> usize {
    let count_in = |v: &FieldValue| value_tokens(v).iter().filter(|t| *t == token).count();
    if field.is_empty() {
        doc.fields.values().map(count_in).sum()
    } else {
        doc.fields.get(field).map(count_in).unwrap_or(0)
    }
}

/// Count tokens of `field` satisfying `pred`.
fn matching_tokens(doc: &Document, field: &str, pred: &dyn Fn(&str) -> bool) -> usize {
    let count_in =
        |v: &FieldValue| value_tokens(v).iter().filter(|t| pred(t)).count();
    if field.is_empty() {
        doc.fields.values().map(count_in).sum()
    } else {
        doc.fields.get(field).map(count_in).unwrap_or(0)
    }
}

fn phrase_count(doc: &Document, field: &str, phrase: &[String]) -> usize {
    let count_in = |v: &FieldValue| {
        let tokens = value_tokens(v);
        if tokens.len() < phrase.len() {
            return 0;
        }
        tokens
            .windows(phrase.len())
            .filter(|w| *w == phrase)
            .count()
    };
    if field.is_empty() {
        doc.fields.values().map(count_in).sum()
    } else {
        doc.fields.get(field).map(count_in).unwrap_or(0)
    }
}

impl CompiledQuery {
    /// Evaluate against one document. `Some(score)` on match.
    pub fn score(&self, doc: &Document) -> Option<f64> {
        match self {
            CompiledQuery::Match { field, tokens } => {
                let mut total = 0usize;
                for token in tokens {
                    let n = token_count(doc, field, token);
                    if n == 0 {
                        return None;
                    }
                    total += n;
                }
                Some(total as f64)
            }
            CompiledQuery::Term { field, term } => {
                let n = token_count(doc, field, term);
                (n > 0).then_some(n as f64)
            }
            CompiledQuery::Phrase { field, tokens } => {
                let n = phrase_count(doc, field, tokens);
                (n > 0).then_some((n * tokens.len()) as f64)
            }
            CompiledQuery::Prefix { field, prefix } => {
                let n = matching_tokens(doc, field, &|t| t.starts_with(prefix.as_str()));
                (n > 0).then_some(n as f64)
            }
            CompiledQuery::Pattern { field, re } => {
                let n = matching_tokens(doc, field, &|t| re.is_match(t));
                (n > 0).then_some(n as f64)
            }
            CompiledQuery::DateRange { field, start, end } => {
                let t = doc.fields.get(field)?.as_time()?;
                let ok = start.map_or(true, |s| t >= s) && end.map_or(true, |e| t <= e);
                ok.then_some(1.0)
            }
            CompiledQuery::NumericRange { field, min, max } => {
                let v = doc.fields.get(field)?.as_f64()?;
                let ok = min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m);
                ok.then_some(1.0)
            }
            CompiledQuery::Conjunction(queries) => {
                let mut total = 0f64;
                for q in queries {
                    total += q.score(doc)?;
                }
                Some(total)
            }
            CompiledQuery::Disjunction(queries) => {
                let mut total = 0f64;
                let mut any = false;
                for q in queries {
                    if let Some(s) = q.score(doc) {
                        any = true;
                        total += s;
                    }
                }
                any.then_some(total)
            }
            CompiledQuery::Boolean {
                must,
                should,
                must_not,
            } => {
                let mut total = 0f64;
                for q in must {
                    total += q.score(doc)?;
                }
                for q in must_not {
                    if q.score(doc).is_some() {
                        return None;
                    }
                }
                if !should.is_empty() {
                    let mut any = false;
                    for q in should {
                        if let Some(s) = q.score(doc) {
                            any = true;
                            total += s;
                        }
                    }
                    if !any {
                        return None;
                    }
                }
                Some(total)
            }
            CompiledQuery::MatchAll => Some(1.0),
        }
    }
}

// --- query-string mini-language ---------------------------------------

#[derive(Debug, PartialEq)]
enum Occur {
    Should,
    Must,
    MustNot,
}

#[derive(Debug)]
struct Clause {
    occur: Occur,
    field: String,
    phrase: bool,
    value: String,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

fn parse_field_prefix(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(is_ident_char), char(':'))(input)
}

fn parse_quoted(input: &str) -> IResult<&str, &str> {
    let (input, _) = char('"')(input)?;
    let (input, inner) = take_till(|c| c == '"')(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, inner))
}

fn parse_bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '"')(input)
}

fn parse_clause<'a>(input: &'a str) -> IResult<&'a str, Clause> {
    let (input, _) = multispace0(input)?;
    let (input, occur) = opt(alt((char('+'), char('-'))))(input)?;
    let (input, field) = opt(parse_field_prefix)(input)?;
    let (input, (phrase, value)) = alt((
        |i: &'a str| parse_quoted(i).map(|(rest, v)| (rest, (true, v))),
        |i: &'a str| parse_bare(i).map(|(rest, v)| (rest, (false, v))),
    ))(input)?;

    Ok((
        input,
        Clause {
            occur: match occur {
                Some('+') => Occur::Must,
                Some('-') => Occur::MustNot,
                _ => Occur::Should,
            },
            field: field.unwrap_or_default().to_string(),
            phrase,
            value: value.to_string(),
        },
    ))
}

/// Parse the query-string language into a boolean query over matches
/// and phrases. An empty input matches everything.
pub fn parse_query_string(input: &str) -> Result<Query, QueryError> {
    let mut rest = input.trim();
    let mut must = Vec::new();
    let mut should = Vec::new();
    let mut must_not = Vec::new();

    while !rest.is_empty() {
        let (next, clause) = parse_clause(rest)
            .map_err(|_| QueryError::Parse(format!("unparseable clause at '{}'", rest)))?;
        rest = next.trim_start();

        let q = if clause.phrase {
            Query::Phrase {
                field: clause.field,
                terms: vec![clause.value],
            }
        } else {
            Query::Match {
                field: clause.field,
                value: clause.value,
            }
        };
        match clause.occur {
            Occur::Must => must.push(q),
            Occur::MustNot => must_not.push(q),
            Occur::Should => should.push(q),
        }
    }

    if must.is_empty() && should.is_empty() && must_not.is_empty() {
        return Ok(Query::MatchAll);
    }
    Ok(Query::Boolean {
        must,
        should,
        must_not,
    })
}
