use std::borrow::Cow;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::{map, value},
    multi::many0,
    sequence::{delimited, preceded, separated_pair},
};

#[derive(Debug, PartialEq, Eq)]
pub enum Event<'a> {
    ElementStart(&'a str),
    Attribute(&'a str, Cow<'a, str>),
    ElementEnd(&'a str),
    /// Text starting with `<` that is not a well formed tag
    Error(&'a str),
}

const ENTITIES: [(&str, char); 5] = [
    ("&amp;", '&'),
    ("&lt;", '<'),
    ("&gt;", '>'),
    ("&quot;", '"'),
    ("&apos;", '\''),
];

struct Tag<'a> {
    name: &'a str,
    attributes: Vec<(&'a str, &'a str)>,
    self_closing: bool,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn name(input: &str) -> IResult<&str, &str> {
    take_while1(is_name_char)(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_till(|c: char| c == '"'), char('"')),
        delimited(char('\''), take_till(|c: char| c == '\''), char('\'')),
    ))
    .parse(input)
}

fn attribute(input: &str) -> IResult<&str, (&str, &str)> {
    preceded(
        multispace1,
        separated_pair(name, delimited(multispace0, char('='), multispace0), quoted),
    )
    .parse(input)
}

fn start_tag(input: &str) -> IResult<&str, Tag<'_>> {
    map(
        (
            preceded(char('<'), name),
            many0(attribute),
            preceded(
                multispace0,
                alt((value(true, tag("/>")), value(false, tag(">")))),
            ),
        ),
        |(name, attributes, self_closing)| Tag {
            name,
            attributes,
            self_closing,
        },
    )
    .parse(input)
}

fn end_tag(input: &str) -> IResult<&str, &str> {
    delimited(tag("</"), name, preceded(multispace0, char('>'))).parse(input)
}

/// `<?xml ...?>`, `<!-- ... -->` and `<!DOCTYPE ...>`, all skipped.
fn declaration(input: &str) -> IResult<&str, ()> {
    value(
        (),
        (alt((tag("<?"), tag("<!"))), take_till(|c: char| c == '>'), char('>')),
    )
    .parse(input)
}

fn unescape(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    let mut unescaped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        unescaped.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match ENTITIES.iter().find(|(entity, _)| rest.starts_with(entity)) {
            Some((entity, c)) => {
                unescaped.push(*c);
                rest = &rest[entity.len()..];
            }
            None => {
                unescaped.push('&');
                rest = &rest[1..];
            }
        }
    }
    unescaped.push_str(rest);
    Cow::Owned(unescaped)
}

/// Reports the tags found in one line of markup, in document order. Text between tags is
/// ignored, and scanning carries on after a malformed tag.
pub fn scan<'a>(line: &'a str, mut emit: impl FnMut(Event<'a>)) {
    let mut rest = line;
    while let Some(pos) = rest.find('<') {
        rest = &rest[pos..];
        if let Ok((remaining, ())) = declaration(rest) {
            rest = remaining;
        } else if let Ok((remaining, name)) = end_tag(rest) {
            emit(Event::ElementEnd(name));
            rest = remaining;
        } else if let Ok((remaining, tag)) = start_tag(rest) {
            emit(Event::ElementStart(tag.name));
            for (name, text) in tag.attributes {
                emit(Event::Attribute(name, unescape(text)));
            }
            if tag.self_closing {
                emit(Event::ElementEnd(tag.name));
            }
            rest = remaining;
        } else {
            let end = rest.find('>').map_or(rest.len(), |end| end + 1);
            emit(Event::Error(&rest[..end]));
            rest = &rest[1..];
        }
    }
}
