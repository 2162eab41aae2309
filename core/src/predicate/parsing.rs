//! Parser for the textual predicate language.
//!
//! `is_active == true && (last_login < '2024-01-01T00:00:00Z' || name == null)`
//!
//! Bare identifiers on the right hand side refer to columns, quoted text and
//! numbers are literals. Literal types are resolved against the table later.

use std::{io, str::FromStr};

use rust_decimal::Decimal;
use winnow::{
    ascii::{digit1, multispace0, multispace1},
    combinator::{alt, delimited, eof, opt, preceded, repeat, separated},
    error::{ContextError, ErrMode, StrContext, StrContextValue},
    prelude::*,
    token::{literal, one_of, take_while},
};

use super::ast::{ComparisonOperator, LogicalOperator, Operand, Predicate};
use crate::value::SqlValue;

type Input<'a> = &'a str;
type ParserResult<T> = winnow::Result<T, ErrMode<ContextError>>;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("Failed to parse predicate: {0}")]
pub struct ParsePredicateError(pub String);

enum ConditionTail {
    Compare(ComparisonOperator, Operand),
    Like(String),
    In(Vec<SqlValue>),
}

fn parse_identifier(input: &mut Input<'_>) -> ParserResult<String> {
    (
        one_of(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .map(str::to_string)
        .context(StrContext::Expected(StrContextValue::Description("column name")))
        .parse_next(input)
}

fn parse_quoted_string(input: &mut Input<'_>) -> ParserResult<String> {
    let open_quote: char = one_of(['\'', '"']).parse_next(input)?;
    let content = take_while(0.., move |c: char| c != open_quote).parse_next(input)?;

    literal(open_quote)
        .context(StrContext::Expected(StrContextValue::Description(
            "matching closing quote for string literal",
        )))
        .parse_next(input)?;

    Ok(content.to_string())
}

fn parse_number(input: &mut Input<'_>) -> ParserResult<SqlValue> {
    (opt(one_of(['+', '-'])), digit1, opt((literal("."), digit1)))
        .take()
        .try_map(|s: &str| {
            if s.contains('.') {
                Decimal::from_str(s).map(SqlValue::Numeric).map_err(|e| io::Error::other(e.to_string()))
            } else {
                s.parse::<i64>().map(SqlValue::BigInt).map_err(io::Error::other)
            }
        })
        .context(StrContext::Expected(StrContextValue::Description("numeric literal")))
        .parse_next(input)
}

fn keyword_literal(word: &str) -> Option<SqlValue> {
    match word.to_ascii_lowercase().as_str() {
        "true" => Some(SqlValue::Bool(true)),
        "false" => Some(SqlValue::Bool(false)),
        "null" => Some(SqlValue::Null),
        _ => None,
    }
}

fn parse_literal(input: &mut Input<'_>) -> ParserResult<SqlValue> {
    alt((
        parse_quoted_string.map(SqlValue::Text),
        parse_number,
        parse_identifier.verify_map(|word| keyword_literal(&word)),
    ))
    .context(StrContext::Expected(StrContextValue::Description("literal value")))
    .parse_next(input)
}

fn parse_operand(input: &mut Input<'_>) -> ParserResult<Operand> {
    alt((
        parse_quoted_string.map(|s| Operand::Value(SqlValue::Text(s))),
        parse_number.map(Operand::Value),
        parse_identifier.map(|word| match keyword_literal(&word) {
            Some(value) => Operand::Value(value),
            None => Operand::Column(word),
        }),
    ))
    .parse_next(input)
}

fn parse_comparison_operator(input: &mut Input<'_>) -> ParserResult<ComparisonOperator> {
    alt((
        literal("==").value(ComparisonOperator::Eq),
        literal("!=").value(ComparisonOperator::Ne),
        literal(">=").value(ComparisonOperator::Gte),
        literal("<=").value(ComparisonOperator::Lte),
        literal(">").value(ComparisonOperator::Gt),
        literal("<").value(ComparisonOperator::Lt),
    ))
    .context(StrContext::Expected(StrContextValue::Description("comparison operator")))
    .parse_next(input)
}

fn parse_condition_tail(input: &mut Input<'_>) -> ParserResult<ConditionTail> {
    let like = preceded((alt((literal("like"), literal("LIKE"))), multispace1), parse_quoted_string)
        .map(ConditionTail::Like);

    let in_list = preceded(
        (alt((literal("in"), literal("IN"))), multispace0),
        delimited(
            (literal("("), multispace0),
            separated(1.., parse_literal, (multispace0, literal(","), multispace0)),
            (multispace0, literal(")")),
        ),
    )
    .map(ConditionTail::In);

    let compare = (parse_comparison_operator, multispace0, parse_operand)
        .map(|(operator, _, operand)| ConditionTail::Compare(operator, operand));

    alt((compare, like, in_list)).parse_next(input)
}

/// Parses a single condition (e.g. `age > 30`, `name like 'a%'`, `id in (1, 2)`)
fn parse_condition(input: &mut Input<'_>) -> ParserResult<Predicate> {
    let (column, _, tail) = (parse_identifier, multispace0, parse_condition_tail)
        .context(StrContext::Expected(StrContextValue::Description(
            "condition expression (e.g., column == value)",
        )))
        .parse_next(input)?;

    let predicate = match tail {
        ConditionTail::Compare(ComparisonOperator::Eq, Operand::Value(SqlValue::Null)) => {
            Predicate::IsNull(column)
        }
        ConditionTail::Compare(ComparisonOperator::Ne, Operand::Value(SqlValue::Null)) => {
            Predicate::IsNotNull(column)
        }
        ConditionTail::Compare(operator, operand) => Predicate::Compare { column, operator, operand },
        ConditionTail::Like(pattern) => Predicate::Like { column, pattern },
        ConditionTail::In(values) => Predicate::In { column, values },
    };

    Ok(predicate)
}

/// Parses negations, parenthesized expressions and conditions
fn parse_term(input: &mut Input<'_>) -> ParserResult<Predicate> {
    delimited(
        multispace0,
        alt((
            preceded((literal("!"), multispace0), parse_term).map(|inner| Predicate::Not(Box::new(inner))),
            delimited(
                (literal("("), multispace0),
                parse_expression,
                (multispace0, literal(")")).context(StrContext::Expected(
                    StrContextValue::Description("closing parenthesis ')'"),
                )),
            ),
            parse_condition,
        )),
        multispace0,
    )
    .parse_next(input)
}

fn parse_and_expression(input: &mut Input<'_>) -> ParserResult<Predicate> {
    let left = parse_term.parse_next(input)?;

    let and_operator = delimited(multispace0, literal("&&").value(LogicalOperator::And), multispace0);

    repeat(0.., (and_operator, parse_term))
        .fold(
            move || left.clone(),
            |acc, (operator, right)| Predicate::Logical {
                left: Box::new(acc),
                operator,
                right: Box::new(right),
            },
        )
        .parse_next(input)
}

fn parse_or_expression(input: &mut Input<'_>) -> ParserResult<Predicate> {
    let left = parse_and_expression.parse_next(input)?;

    let or_operator = delimited(multispace0, literal("||").value(LogicalOperator::Or), multispace0);

    repeat(0.., (or_operator, parse_and_expression))
        .fold(
            move || left.clone(),
            |acc, (operator, right)| Predicate::Logical {
                left: Box::new(acc),
                operator,
                right: Box::new(right),
            },
        )
        .parse_next(input)
}

fn parse_expression(input: &mut Input<'_>) -> ParserResult<Predicate> {
    delimited(multispace0, parse_or_expression, multispace0).parse_next(input)
}

/// Parses a predicate expression string into a `Predicate` tree.
pub fn parse(expression: &str) -> Result<Predicate, ParsePredicateError> {
    (parse_expression, eof)
        .map(|(predicate, _)| predicate)
        .parse(expression)
        .map_err(|e| ParsePredicateError(e.to_string()))
}

/// Parses a single literal, e.g. the right hand side of `--set column=value`.
pub fn parse_value(value: &str) -> Result<SqlValue, ParsePredicateError> {
    let trimmed = value.trim();
    match (parse_literal, eof).map(|(v, _)| v).parse(trimmed) {
        Ok(value) => Ok(value),
        // unquoted words are accepted as text
        Err(_) if !trimmed.is_empty() => Ok(SqlValue::Text(trimmed.to_string())),
        Err(e) => Err(ParsePredicateError(e.to_string())),
    }
}
