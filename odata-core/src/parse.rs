//! Reference grammar of the `$filter` dialect.
//!
//! [parse_filter] reads filter text as the compiler renders it (optionally
//! still percent-encoded) back into an [Expression]. Literals of every
//! revision are accepted regardless of the revision passed in; the revision
//! only decides how protocol function names map back to canonical ones.

use std::str::FromStr;

use base64::Engine;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1, take_while_m_n};
use nom::character::complete::{char, digit1, multispace0, multispace1, none_of, one_of};
use nom::combinator::{eof, map, not, opt, peek, recognize, value};
use nom::error::ErrorKind;
use nom::multi::{many0, separated_list1};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::{IResult, Parser};
use nom_locate::LocatedSpan;
use percent_encoding::percent_decode_str;
use rust_decimal::Decimal;

use crate::error::Error;
use crate::expression::{BinaryOp, Expression, UnaryOp};
use crate::functions;
use crate::value::{ProtocolRevision, Value};

type Span<'a> = LocatedSpan<&'a str>;

fn fail<T>(text: Span, kind: ErrorKind) -> IResult<Span, T> {
    Err(nom::Err::Error(nom::error::Error::new(text, kind)))
}

fn failure<T>(text: Span, kind: ErrorKind) -> IResult<Span, T> {
    Err(nom::Err::Failure(nom::error::Error::new(text, kind)))
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn identifier(text: Span) -> IResult<Span, String> {
    let (text, a) = take_while1(|c: char| c.is_alphabetic() || c == '_').parse(text)?;
    let (text, b) = take_while(is_identifier_char).parse(text)?;
    Ok((text, format!("{}{}", a, b)))
}

/// A keyword not followed by an identifier character.
fn keyword<'a>(word: &'static str) -> impl Parser<Span<'a>, Output = Span<'a>, Error = nom::error::Error<Span<'a>>> {
    terminated(tag(word), not(peek(take_while_m_n(1, 1, is_identifier_char))))
}

fn quoted(text: Span) -> IResult<Span, String> {
    let (text, chars) = delimited(
        char('\''),
        many0(alt((value('\'', tag("''")), none_of("'")))),
        char('\''),
    )
    .parse(text)?;
    Ok((text, chars.into_iter().collect()))
}

fn string_literal(text: Span) -> IResult<Span, Value> {
    map(quoted, Value::String).parse(text)
}

fn keyword_literal(text: Span) -> IResult<Span, Value> {
    alt((
        value(Value::Null, keyword("null")),
        value(Value::Boolean(true), keyword("true")),
        value(Value::Boolean(false), keyword("false")),
        value(Value::Double(f64::NAN), keyword("NaN")),
        value(Value::Double(f64::INFINITY), keyword("INF")),
        value(Value::Double(f64::NEG_INFINITY), keyword("-INF")),
    ))
    .parse(text)
}

/// ISO 8601 duration such as `P1DT2H30M` or `-PT0.5S`.
fn parse_duration(text: &str) -> Option<chrono::Duration> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let rest = rest.strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };
    let mut total = chrono::Duration::zero();
    if !date.is_empty() {
        let days = date.strip_suffix('D')?.parse::<i64>().ok()?;
        total = total + chrono::Duration::days(days);
    }
    if let Some(time) = time {
        let mut number = String::new();
        for c in time.chars() {
            match c {
                'H' => total = total + chrono::Duration::hours(number.parse().ok()?),
                'M' => total = total + chrono::Duration::minutes(number.parse().ok()?),
                'S' => {
                    let seconds: f64 = number.parse().ok()?;
                    let nanos = (seconds * 1_000_000_000.0).round() as i64;
                    total = total + chrono::Duration::nanoseconds(nanos);
                }
                c if c.is_ascii_digit() || c == '.' => {
                    number.push(c);
                    continue;
                }
                _ => return None,
            }
            number.clear();
        }
        if !number.is_empty() {
            return None;
        }
    }
    Some(if negative { -total } else { total })
}

fn prefixed_value(prefix: &str, body: &str) -> Option<Value> {
    match prefix {
        "datetime" => chrono::NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(body, "%Y-%m-%dT%H:%M"))
            .ok()
            .map(Value::DateTime),
        "datetimeoffset" => chrono::DateTime::parse_from_rfc3339(body)
            .ok()
            .map(Value::DateTimeOffset),
        "guid" => uuid::Uuid::parse_str(body).ok().map(Value::Guid),
        "time" | "duration" => parse_duration(body).map(Value::Duration),
        "X" => hex::decode(body).ok().map(Value::Binary),
        "binary" => base64::engine::general_purpose::URL_SAFE
            .decode(body)
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(body))
            .ok()
            .map(Value::Binary),
        _ => None,
    }
}

/// `datetime'...'`, `guid'...'`, `X'0A'`, `duration'PT1H'` and the like.
fn prefixed_literal(text: Span) -> IResult<Span, Value> {
    let start = text;
    let (text, (prefix, body)) =
        pair(take_while1(|c: char| c.is_ascii_alphabetic()), quoted).parse(text)?;
    match prefixed_value(prefix.fragment(), &body) {
        Some(value) => Ok((text, value)),
        None => failure(start, ErrorKind::Verify),
    }
}

fn digits<'a>(n: usize) -> impl Parser<Span<'a>, Output = Span<'a>, Error = nom::error::Error<Span<'a>>> {
    take_while_m_n(n, n, |c: char| c.is_ascii_digit())
}

fn hex_digits<'a>(n: usize) -> impl Parser<Span<'a>, Output = Span<'a>, Error = nom::error::Error<Span<'a>>> {
    take_while_m_n(n, n, |c: char| c.is_ascii_hexdigit())
}

/// Guid without a prefix, as written by the V4 dialect.
fn bare_guid(text: Span) -> IResult<Span, Value> {
    let start = text;
    let (text, guid) = terminated(
        recognize((
            hex_digits(8),
            char('-'),
            hex_digits(4),
            char('-'),
            hex_digits(4),
            char('-'),
            hex_digits(4),
            char('-'),
            hex_digits(12),
        )),
        not(peek(take_while_m_n(1, 1, is_identifier_char))),
    )
    .parse(text)?;
    match uuid::Uuid::parse_str(guid.fragment()) {
        Ok(guid) => Ok((text, Value::Guid(guid))),
        Err(_) => failure(start, ErrorKind::Verify),
    }
}

/// Date-time without a prefix, as written by the V4 dialect.
///
/// A trailing `Z` gives a [Value::DateTime], an explicit offset a [Value::DateTimeOffset].
fn bare_datetime(text: Span) -> IResult<Span, Value> {
    let start = text;
    let (text, datetime) = recognize((
        digits(4),
        char('-'),
        digits(2),
        char('-'),
        digits(2),
        char('T'),
        take_while1(|c: char| c.is_ascii_digit() || c == ':' || c == '.'),
        opt(alt((
            tag("Z"),
            recognize((one_of("+-"), digits(2), char(':'), digits(2))),
        ))),
    ))
    .parse(text)?;
    let datetime = *datetime.fragment();
    let value = match datetime.strip_suffix('Z') {
        Some(naive) => prefixed_value("datetime", naive),
        None if datetime.len() > 19 && datetime[19..].contains(['+', '-']) => {
            prefixed_value("datetimeoffset", datetime)
        }
        None => prefixed_value("datetime", datetime),
    };
    match value {
        Some(value) => Ok((text, value)),
        None => failure(start, ErrorKind::Verify),
    }
}

fn number_literal(text: Span) -> IResult<Span, Value> {
    let start = text;
    let (text, number) = recognize((
        opt(char('-')),
        digit1,
        opt(pair(char('.'), digit1)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(text)?;
    let (text, suffix) = terminated(
        opt(one_of("LlfFdDmM")),
        not(peek(take_while_m_n(1, 1, is_identifier_char))),
    )
    .parse(text)?;
    let number = *number.fragment();
    let fractional = number.contains(['.', 'e', 'E']);
    let value = match suffix {
        Some('L') | Some('l') if !fractional => number.parse::<i64>().ok().map(Value::Int64),
        Some('f') | Some('F') => number.parse::<f32>().ok().map(Value::Single),
        Some('d') | Some('D') => number.parse::<f64>().ok().map(Value::Double),
        Some('m') | Some('M') => Decimal::from_str(number)
            .or_else(|_| Decimal::from_scientific(number))
            .ok()
            .map(Value::Decimal),
        Some(_) => None,
        None if fractional => number.parse::<f64>().ok().map(Value::Double),
        None => match number.parse::<i64>() {
            Ok(x) => Some(match i32::try_from(x) {
                Ok(x) => Value::Int32(x),
                Err(_) => Value::Int64(x),
            }),
            Err(_) => None,
        },
    };
    match value {
        Some(value) => Ok((text, value)),
        None => failure(start, ErrorKind::Verify),
    }
}

fn literal(text: Span) -> IResult<Span, Expression> {
    map(
        alt((
            keyword_literal,
            string_literal,
            bare_guid,
            bare_datetime,
            number_literal,
            prefixed_literal,
        )),
        Expression::Literal,
    )
    .parse(text)
}

fn path(text: Span) -> IResult<Span, Expression> {
    map(separated_list1(one_of("/."), identifier), Expression::Reference).parse(text)
}

/// Function call as written; the first argument is kept as the target until
/// [canonicalize] maps the protocol name.
fn function_call(text: Span) -> IResult<Span, Expression> {
    let (text, name) = identifier(text)?;
    let (text, args) = delimited(
        pair(char('('), multispace0),
        separated_list1(delimited(multispace0, char(','), multispace0), or_expr),
        pair(multispace0, char(')')),
    )
    .parse(text)?;
    let mut args = args.into_iter();
    match args.next() {
        Some(target) => Ok((text, Expression::function(&name, target, args.collect()))),
        None => fail(text, ErrorKind::SeparatedList),
    }
}

fn parenthesized(text: Span) -> IResult<Span, Expression> {
    delimited(
        pair(char('('), multispace0),
        or_expr,
        pair(multispace0, char(')')),
    )
    .parse(text)
}

fn primary(text: Span) -> IResult<Span, Expression> {
    alt((parenthesized, literal, function_call, path)).parse(text)
}

fn not_expr(text: Span) -> IResult<Span, Expression> {
    let (text, _) = tag("not").parse(text)?;
    let (text, operand) = alt((
        preceded(multispace0, parenthesized),
        preceded(multispace1, unary_expr),
    ))
    .parse(text)?;
    Ok((text, Expression::unary(UnaryOp::Not, operand)))
}

fn negate_expr(text: Span) -> IResult<Span, Expression> {
    let (text, operand) = preceded(char('-'), unary_expr).parse(text)?;
    Ok((text, Expression::unary(UnaryOp::Negate, operand)))
}

fn unary_expr(text: Span) -> IResult<Span, Expression> {
    alt((not_expr, primary, negate_expr)).parse(text)
}

fn operator<'a>(text: Span<'a>, allowed: &[BinaryOp]) -> IResult<Span<'a>, BinaryOp> {
    let start = text;
    let (text, word) = delimited(
        multispace1,
        take_while1(|c: char| c.is_ascii_alphabetic()),
        multispace1,
    )
    .parse(text)?;
    match BinaryOp::from_keyword(word.fragment()) {
        Some(op) if allowed.contains(&op) => Ok((text, op)),
        _ => fail(start, ErrorKind::Tag),
    }
}

fn left_associative<'a>(
    text: Span<'a>,
    allowed: &[BinaryOp],
    operand: fn(Span<'a>) -> IResult<Span<'a>, Expression>,
) -> IResult<Span<'a>, Expression> {
    let (mut text, mut left) = operand(text)?;
    loop {
        match operator(text, allowed) {
            Ok((rest, op)) => {
                let (rest, right) = operand(rest)?;
                left = Expression::binary(op, left, right);
                text = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((text, left)),
            Err(e) => return Err(e),
        }
    }
}

fn multiplicative(text: Span) -> IResult<Span, Expression> {
    left_associative(text, &[BinaryOp::Mul, BinaryOp::Div, BinaryOp::Mod], unary_expr)
}

fn additive(text: Span) -> IResult<Span, Expression> {
    left_associative(text, &[BinaryOp::Add, BinaryOp::Sub], multiplicative)
}

fn comparison(text: Span) -> IResult<Span, Expression> {
    let (text, left) = additive(text)?;
    let allowed = [
        BinaryOp::Eq,
        BinaryOp::Ne,
        BinaryOp::Lt,
        BinaryOp::Le,
        BinaryOp::Gt,
        BinaryOp::Ge,
    ];
    match operator(text, &allowed) {
        Ok((rest, op)) => {
            let (rest, right) = additive(rest)?;
            Ok((rest, Expression::binary(op, left, right)))
        }
        Err(nom::Err::Error(_)) => Ok((text, left)),
        Err(e) => Err(e),
    }
}

fn and_expr(text: Span) -> IResult<Span, Expression> {
    left_associative(text, &[BinaryOp::And], comparison)
}

fn or_expr(text: Span) -> IResult<Span, Expression> {
    left_associative(text, &[BinaryOp::Or], and_expr)
}

fn filter(text: Span) -> IResult<Span, Expression> {
    terminated(delimited(multispace0, or_expr, multispace0), eof).parse(text)
}

/// Map protocol function names to canonical ones and restore the target position.
fn canonicalize(expression: Expression, revision: ProtocolRevision) -> Result<Expression, Error> {
    Ok(match expression {
        Expression::Function { name, target, args } => {
            let mapping = functions::from_protocol_name(&name.to_lowercase(), revision)
                .ok_or_else(|| Error::unsupported_function(&name, revision))?;
            let mut operands = Vec::with_capacity(args.len() + 1);
            operands.push(canonicalize(*target, revision)?);
            for arg in args {
                operands.push(canonicalize(arg, revision)?);
            }
            let target = if mapping.target_last(revision) {
                operands.pop()
            } else if operands.is_empty() {
                None
            } else {
                Some(operands.remove(0))
            };
            let target = target.ok_or_else(|| {
                Error::invalid_argument(format!("Function '{}' has no arguments", name))
            })?;
            mapping.check_arguments(&operands)?;
            Expression::function(mapping.canonical, target, operands)
        }
        Expression::Unary { op, operand } => {
            Expression::unary(op, canonicalize(*operand, revision)?)
        }
        Expression::Binary { op, left, right } => Expression::binary(
            op,
            canonicalize(*left, revision)?,
            canonicalize(*right, revision)?,
        ),
        other => other,
    })
}

/// Parse `$filter` text (percent-encoded or not) into an expression.
pub fn parse_filter(text: &str, revision: ProtocolRevision) -> Result<Expression, Error> {
    let decoded = percent_decode_str(text)
        .decode_utf8()
        .map_err(|e| Error::parse_error(text, &e.to_string(), 0))?;
    let (_, expression) = filter(Span::new(&decoded)).map_err(|e| match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => Error::parse_error(
            &decoded,
            &format!("unexpected '{}'", e.input.fragment().chars().take(16).collect::<String>()),
            e.input.location_offset(),
        ),
        nom::Err::Incomplete(_) => Error::parse_error(&decoded, "incomplete input", decoded.len()),
    })?;
    canonicalize(expression, revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorType;

    #[test]
    fn comparisons_and_logic() -> Result<(), Error> {
        assert_eq!(
            parse_filter("ProductID eq 1", ProtocolRevision::V4)?,
            Expression::reference("ProductID").equal(1)
        );
        assert_eq!(
            parse_filter("not%28ProductID%20eq%201%29", ProtocolRevision::V4)?,
            !Expression::reference("ProductID").equal(1)
        );
        assert_eq!(
            parse_filter("A eq 1 or B eq 2 and C eq 3", ProtocolRevision::V4)?,
            Expression::reference("A")
                .equal(1)
                .or(Expression::reference("B").equal(2).and(Expression::reference("C").equal(3)))
        );
        assert_eq!(
            parse_filter("(A eq 1 or B eq 2) and Category/Name ne null", ProtocolRevision::V4)?,
            Expression::reference("A")
                .equal(1)
                .or(Expression::reference("B").equal(2))
                .and(Expression::reference("Category.Name").not_equal(Expression::null()))
        );
        Ok(())
    }

    #[test]
    fn arithmetic_precedence() -> Result<(), Error> {
        assert_eq!(
            parse_filter("Price sub Discount mul 2 gt -Cost", ProtocolRevision::V4)?,
            (Expression::reference("Price") - Expression::reference("Discount") * 2)
                .greater_than(-Expression::reference("Cost"))
        );
        assert_eq!(
            parse_filter("-(A add B) lt -5", ProtocolRevision::V4)?,
            (-(Expression::reference("A") + Expression::reference("B"))).less_than(-5)
        );
        assert_eq!(
            parse_filter("A eq -(5)", ProtocolRevision::V4)?,
            Expression::reference("A").equal(-Expression::literal(5))
        );
        Ok(())
    }

    #[test]
    fn literals_of_every_revision() -> Result<(), Error> {
        let cases: Vec<(&str, Value)> = vec![
            ("'O''Neil'", Value::String("O'Neil".to_owned())),
            ("1L", Value::Int64(1)),
            ("3000000000", Value::Int64(3_000_000_000)),
            ("1.5", Value::Double(1.5)),
            ("1.5d", Value::Double(1.5)),
            ("2.5f", Value::Single(2.5)),
            ("10.25M", Value::Decimal(Decimal::new(1025, 2))),
            ("true", Value::Boolean(true)),
            (
                "datetime'2024-01-02T03:04:05'",
                Value::DateTime(
                    chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
                        .and_then(|d| d.and_hms_opt(3, 4, 5))
                        .ok_or_else(|| Error::general_error("date".to_owned()))?,
                ),
            ),
            (
                "2024-01-02T03:04:05Z",
                Value::DateTime(
                    chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
                        .and_then(|d| d.and_hms_opt(3, 4, 5))
                        .ok_or_else(|| Error::general_error("date".to_owned()))?,
                ),
            ),
            ("duration'PT1H30M'", Value::Duration(chrono::Duration::minutes(90))),
            ("time'P1DT0.5S'", Value::Duration(chrono::Duration::milliseconds(86_400_500))),
            ("X'0AFF'", Value::Binary(vec![0x0a, 0xff])),
        ];
        for (text, expected) in cases {
            assert_eq!(
                parse_filter(&format!("Value eq {}", text), ProtocolRevision::V3)?,
                Expression::reference("Value").equal(expected),
                "{}",
                text
            );
        }
        let guid = uuid::Uuid::parse_str("21ec2020-3aea-1069-a2dd-08002b30309d")
            .map_err(|e| Error::general_error(e.to_string()))?;
        for text in [
            "guid'21ec2020-3aea-1069-a2dd-08002b30309d'",
            "21ec2020-3aea-1069-a2dd-08002b30309d",
        ] {
            assert_eq!(
                parse_filter(&format!("Id eq {}", text), ProtocolRevision::V4)?,
                Expression::reference("Id").equal(guid)
            );
        }
        Ok(())
    }

    #[test]
    fn functions_map_back_to_canonical_names() -> Result<(), Error> {
        let expected = Expression::reference("ProductName").call("contains", vec!["ai".into()]);
        assert_eq!(
            parse_filter("substringof('ai',ProductName)", ProtocolRevision::V2)?,
            expected
        );
        assert_eq!(
            parse_filter("contains(ProductName,'ai')", ProtocolRevision::V4)?,
            expected
        );
        assert_eq!(
            parse_filter("length(tolower(Name)) eq 4", ProtocolRevision::V4)?,
            Expression::reference("Name")
                .call("to_lowercase", vec![])
                .call("len", vec![])
                .equal(4)
        );
        assert_eq!(
            parse_filter("substring(Name, 1, 2) eq 'ab'", ProtocolRevision::V4)?,
            Expression::reference("Name")
                .call("substring", vec![1.into(), 2.into()])
                .equal("ab")
        );
        Ok(())
    }

    #[test]
    fn errors_carry_positions() {
        let e = parse_filter("ProductID eq", ProtocolRevision::V4).unwrap_err();
        assert_eq!(e.error_type, ErrorType::ParseError);
        let e = parse_filter("A eq 1 xor B eq 2", ProtocolRevision::V4).unwrap_err();
        assert_eq!(e.error_type, ErrorType::ParseError);
        assert!(e.message.contains("position 7"), "{}", e.message);
        let e = parse_filter("Data eq X'0AF'", ProtocolRevision::V3).unwrap_err();
        assert_eq!(e.error_type, ErrorType::ParseError);
        let e = parse_filter("frobnicate(Name) eq 1", ProtocolRevision::V4).unwrap_err();
        assert_eq!(e.error_type, ErrorType::UnsupportedFunction);
        let e = parse_filter("substringof('a',Name)", ProtocolRevision::V4).unwrap_err();
        assert_eq!(e.error_type, ErrorType::UnsupportedFunction);
    }
}
