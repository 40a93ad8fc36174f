use bytes::BufMut;

use crate::Data;

const CRLF: &[u8] = b"\r\n";

fn put_header<B: BufMut>(prefix: u8, len: impl ToString, output: &mut B) {
	output.put_u8(prefix);
	output.put_slice(len.to_string().as_bytes());
	output.put_slice(CRLF);
}

/// Serialize data using RESP.
#[tracing::instrument(level = "trace", skip_all)]
pub fn to_bytes<B: BufMut>(data: &Data<'_>, output: &mut B) {
	match data {
		Data::SimpleString(str) => {
			output.put_u8(b'+');
			output.put_slice(str.as_bytes());
			output.put_slice(CRLF);
		}
		Data::Error(str) => {
			output.put_u8(b'-');
			output.put_slice(str.as_bytes());
			output.put_slice(CRLF);
		}
		Data::Integer(int) => put_header(b':', int, output),
		Data::BulkString(bytes) => {
			put_header(b'$', bytes.len(), output);
			output.put_slice(bytes);
			output.put_slice(CRLF);
		}
		Data::Array(items) => {
			put_header(b'*', items.len(), output);
			for item in items {
				to_bytes(item, output);
			}
		}
		Data::Null => output.put_slice(b"$-1\r\n"),
	}
}

#[cfg(test)]
mod test {
	use bytes::BytesMut;

	use crate::{array, Data};

	use super::to_bytes;

	#[test]
	fn ser_str() {
		let mut output = BytesMut::new();
		to_bytes(&Data::simple_string("OK"), &mut output);

		assert_eq!(&output[..], b"+OK\r\n");
	}

	#[test]
	fn ser_command() {
		let mut output = BytesMut::new();
		to_bytes(&Data::from_bytes_iter(["GET", "foo"].iter()), &mut output);

		assert_eq!(&output[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
	}

	#[test]
	fn ser_nested() {
		let mut output = BytesMut::new();
		to_bytes(&array![Data::Integer(1), Data::Null, Data::Error("ERR x".into())], &mut output);

		assert_eq!(&output[..], b"*3\r\n:1\r\n$-1\r\n-ERR x\r\n");
	}
}
