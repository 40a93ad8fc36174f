use std::str::from_utf8;

use nom::{
	branch::alt,
	bytes::streaming::take,
	character::streaming::{char, crlf, i64, not_line_ending},
	combinator::{map, map_res},
	error::ErrorKind,
	sequence::{delimited, terminated},
	IResult,
};

use crate::Data;

pub type Error<'a> = nom::Err<nom::error::Error<&'a [u8]>>;

/// Upper bound on the capacity pre-allocated for an array header, so a hostile length can't
/// force a huge allocation before any element arrives.
const MAX_PREALLOC: usize = 1024;

pub fn parse_str(data: &[u8]) -> IResult<&[u8], &str> {
	map_res(delimited(char('+'), not_line_ending, crlf), from_utf8)(data)
}

pub fn parse_err(data: &[u8]) -> IResult<&[u8], &str> {
	map_res(delimited(char('-'), not_line_ending, crlf), from_utf8)(data)
}

pub fn parse_int(data: &[u8]) -> IResult<&[u8], i64> {
	delimited(char(':'), i64, crlf)(data)
}

pub fn parse_bytes(data: &[u8]) -> IResult<&[u8], Option<&[u8]>> {
	let (data, len) = delimited(char('$'), i64, crlf)(data)?;
	Ok(match len {
		-1 => (data, None),
		0.. => map(terminated(take(len as usize), crlf), Some)(data)?,
		_ => Err(nom::Err::Failure(nom::error::Error::new(
			data,
			ErrorKind::Digit,
		)))?,
	})
}

pub fn parse_array(data: &[u8]) -> IResult<&[u8], i64> {
	delimited(char('*'), i64, crlf)(data)
}

fn parse_array_data(data: &[u8]) -> IResult<&[u8], Data<'_>> {
	let (mut data, len) = parse_array(data)?;
	if len == -1 {
		return Ok((data, Data::Null));
	}

	let len = usize::try_from(len)
		.map_err(|_| nom::Err::Failure(nom::error::Error::new(data, ErrorKind::Digit)))?;

	let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
	for _ in 0..len {
		let (rem, item) = parse(data)?;
		items.push(item);
		data = rem;
	}

	Ok((data, Data::Array(items)))
}

/// Parse a single RESP value, borrowing from the input.
///
/// Returns [nom::Err::Incomplete] until the whole value is available.
pub fn parse(data: &[u8]) -> IResult<&[u8], Data<'_>> {
	alt((
		map(parse_str, |str| Data::SimpleString(str.into())),
		map(parse_err, |str| Data::Error(str.into())),
		map(parse_int, Data::Integer),
		map(parse_bytes, |bytes| match bytes {
			Some(bytes) => Data::BulkString(bytes.into()),
			None => Data::Null,
		}),
		parse_array_data,
	))(data)
}
