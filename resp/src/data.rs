use std::borrow::Cow;

/// RESP data. Read the [Redis documenation](https://redis.io/commands) for details on which type
/// to expect as a response.
///
/// Both bulk strings and arrays can be null in RESP; either form is represented here as
/// [Data::Null].
///
/// Top-level error replies are never represented as data: they are returned as
/// [`Error::Redis`](crate::Error::Redis) from the codec. Errors nested inside an array (as in the
/// reply to `EXEC`) are kept as [Data::Error] so the sibling replies survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data<'a> {
	SimpleString(Cow<'a, str>),
	Error(Cow<'a, str>),
	Integer(i64),
	BulkString(Cow<'a, [u8]>),
	Array(Vec<Data<'a>>),
	Null,
}

impl<'a> Data<'a> {
	/// Convenience method to create a [Data::SimpleString].
	pub fn simple_string<T>(str: &'a T) -> Self
	where
		T: AsRef<str> + ?Sized,
	{
		Self::SimpleString(str.as_ref().into())
	}

	/// Convenience method to create a [Data::BulkString].
	pub fn bulk_string<T>(bytes: &'a T) -> Self
	where
		T: AsRef<[u8]> + ?Sized,
	{
		Self::BulkString(bytes.as_ref().into())
	}

	/// Build a command: an array of bulk strings.
	pub fn from_bytes_iter<I, B>(iter: I) -> Data<'a>
	where
		I: IntoIterator<Item = &'a B>,
		B: 'a + AsRef<[u8]> + ?Sized,
	{
		Data::Array(iter.into_iter().map(Data::bulk_string).collect())
	}

	/// Convert this data into owned data.
	pub fn into_owned(self) -> Data<'static> {
		match self {
			Self::SimpleString(str) => Data::SimpleString(str.into_owned().into()),
			Self::Error(str) => Data::Error(str.into_owned().into()),
			Self::Integer(int) => Data::Integer(int),
			Self::BulkString(bytes) => Data::BulkString(bytes.into_owned().into()),
			Self::Array(arr) => Data::Array(arr.into_iter().map(Data::into_owned).collect()),
			Self::Null => Data::Null,
		}
	}

	/// The raw bytes of a simple or bulk string.
	pub fn as_bytes(&self) -> Option<&[u8]> {
		match self {
			Self::SimpleString(str) => Some(str.as_bytes()),
			Self::BulkString(bytes) => Some(bytes),
			_ => None,
		}
	}

	/// A simple string, or a bulk string containing valid UTF-8.
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::SimpleString(str) => Some(str),
			Self::BulkString(bytes) => std::str::from_utf8(bytes).ok(),
			_ => None,
		}
	}

	pub fn as_integer(&self) -> Option<i64> {
		match self {
			Self::Integer(int) => Some(*int),
			_ => None,
		}
	}

	pub fn into_array(self) -> Option<Vec<Data<'a>>> {
		match self {
			Self::Array(arr) => Some(arr),
			_ => None,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}
}

impl<'a> From<&'a str> for Data<'a> {
	fn from(str: &'a str) -> Self {
		Data::SimpleString(str.into())
	}
}

impl From<i64> for Data<'_> {
	fn from(i: i64) -> Self {
		Data::Integer(i)
	}
}

impl<'a, const N: usize> From<&'a [u8; N]> for Data<'a> {
	fn from(bytes: &'a [u8; N]) -> Self {
		Self::bulk_string(bytes)
	}
}

impl<'a> From<&'a [u8]> for Data<'a> {
	fn from(bytes: &'a [u8]) -> Self {
		Self::BulkString(bytes.into())
	}
}

impl PartialEq<&str> for Data<'_> {
	fn eq(&self, other: &&str) -> bool {
		matches!(self, Data::SimpleString(str) if str == other)
	}
}

impl<const N: usize> PartialEq<&[u8; N]> for Data<'_> {
	fn eq(&self, other: &&[u8; N]) -> bool {
		matches!(self, Data::BulkString(bytes) if bytes.as_ref() == *other)
	}
}

impl PartialEq<i64> for Data<'_> {
	fn eq(&self, other: &i64) -> bool {
		matches!(self, Data::Integer(i) if *i == *other)
	}
}

/// Macro to simplify making a [Data::Array].
///
/// ```rust
/// # use shardis_resp::{array, Data};
/// assert_eq!(
/// 	array!("foo", b"bar"),
/// 	Data::Array(vec![Data::simple_string("foo"), Data::bulk_string(b"bar")])
/// );
/// ```
#[macro_export]
macro_rules! array {
	($($items:expr),*) => {
		$crate::Data::Array(vec![$($crate::Data::from($items)),*])
	};
}
