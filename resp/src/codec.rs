use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{parser, to_bytes, Data, Error};

/// Tokio codec with [`Encoder`] and [`Decoder`] for RESP.
///
/// This codec has a Result as its Item in order to represent transient errors: an error reply
/// from the server is yielded as `Some(Err(_))` and does not terminate the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct Codec;

impl Decoder for Codec {
	type Item = Result<Data<'static>, Error>;

	type Error = Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		let start_len = src.len();
		if start_len == 0 {
			return Ok(None);
		}

		let (consumed, data) = match parser::parse(src) {
			Ok((rem, data)) => (start_len - rem.len(), data.into_owned()),
			Err(nom::Err::Incomplete(needed)) => {
				if let nom::Needed::Size(size) = needed {
					src.reserve(size.into());
				}

				return Ok(None);
			}
			Err(err) => return Err(Error::Parse(err.to_string())),
		};

		src.advance(consumed);
		Ok(Some(match data {
			Data::Error(msg) => Err(Error::Redis(msg.into_owned())),
			data => Ok(data),
		}))
	}
}

impl<'a> Encoder<Data<'a>> for Codec {
	type Error = Error;

	fn encode(&mut self, item: Data<'a>, dst: &mut BytesMut) -> Result<(), Self::Error> {
		to_bytes(&item, dst);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use bytes::BytesMut;
	use futures::{SinkExt, TryStreamExt};
	use tokio_util::codec::{Decoder, FramedRead, FramedWrite};

	use crate::{array, Data, Error};

	use super::Codec;

	#[test]
	fn decode_partial() {
		let mut codec = Codec;
		let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo"[..]);

		assert!(codec.decode(&mut buf).expect("decode").is_none());

		buf.extend_from_slice(b"\r\n:7\r\n+OK\r\n");
		let data = codec.decode(&mut buf).expect("decode").expect("frame");
		assert_eq!(data.expect("data"), array![b"foo", 7i64]);
		assert_eq!(&buf[..], b"+OK\r\n");
	}

	#[test]
	fn decode_error_reply_is_transient() {
		let mut codec = Codec;
		let mut buf = BytesMut::from(&b"-READONLY You can't write\r\n+OK\r\n"[..]);

		let first = codec.decode(&mut buf).expect("decode").expect("frame");
		assert!(matches!(first, Err(Error::Redis(msg)) if msg.starts_with("READONLY")));

		let second = codec.decode(&mut buf).expect("decode").expect("frame");
		assert_eq!(second.expect("data"), "OK");
	}

	#[test]
	fn decode_garbage_is_fatal() {
		let mut buf = BytesMut::from(&b"!nope\r\n"[..]);
		assert!(matches!(Codec.decode(&mut buf), Err(Error::Parse(_))));
	}

	#[tokio::test]
	async fn framed_roundtrip() {
		let mut written = Vec::new();
		{
			let mut sink = FramedWrite::new(&mut written, Codec);
			sink.send(Data::from_bytes_iter(["PING"].iter()))
				.await
				.expect("send");
		}

		let frames: Vec<_> = FramedRead::new(&written[..], Codec)
			.try_collect()
			.await
			.expect("read frames");

		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].as_ref().expect("data"), &array![b"PING"]);
	}
}
