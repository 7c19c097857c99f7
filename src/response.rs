use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, header};

/// Wraps the downstream response writer so response-phase rules can read
/// and mutate status, headers, and body before anything reaches the client
/// (spec §4.4). `Flush` is the only point at which bytes actually leave the
/// buffer; everything before that is free to rewrite.
pub struct ResponseBuffer {
	status: StatusCode,
	headers: HeaderMap,
	body: BytesMut,
	flushed: bool,
}

impl ResponseBuffer {
	pub fn new() -> Self {
		Self {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: BytesMut::new(),
			flushed: false,
		}
	}

	/// Captures the status without forwarding it downstream.
	pub fn write_header(&mut self, code: StatusCode) {
		if !self.flushed {
			self.status = code;
		}
	}

	/// Buffers bytes; no-op once flushed.
	pub fn write(&mut self, b: &[u8]) {
		if !self.flushed {
			self.body.extend_from_slice(b);
		}
	}

	/// Returns the real headers so rules can mutate them in place.
	pub fn headers_mut(&mut self) -> &mut HeaderMap {
		&mut self.headers
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn status(&self) -> StatusCode {
		self.status
	}

	pub fn body(&self) -> &[u8] {
		&self.body
	}

	/// Replaces the buffered status; ignored after flush.
	pub fn set_status_code(&mut self, code: StatusCode) {
		if !self.flushed {
			self.status = code;
		}
	}

	/// Replaces the buffered body; ignored after flush.
	pub fn set_body(&mut self, body: impl Into<Bytes>) {
		if !self.flushed {
			self.body = BytesMut::from(&body.into()[..]);
		}
	}

	pub fn is_flushed(&self) -> bool {
		self.flushed
	}

	/// Idempotent: deletes any stale Content-Length, sets it from the final
	/// buffer length if non-empty, then marks the buffer flushed. Returns
	/// the (status, headers, body) triple the caller should actually write.
	pub fn flush(&mut self) -> (StatusCode, HeaderMap, Bytes) {
		if self.flushed {
			return (self.status, self.headers.clone(), self.body.clone().freeze());
		}
		self.headers.remove(header::CONTENT_LENGTH);
		if !self.body.is_empty() {
			self.headers.insert(header::CONTENT_LENGTH, self.body.len().into());
		}
		self.flushed = true;
		(self.status, self.headers.clone(), self.body.clone().freeze())
	}
}

impl Default for ResponseBuffer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn writes_concatenate_until_flush() {
		let mut buf = ResponseBuffer::new();
		buf.write_header(StatusCode::OK);
		buf.write(b"hello, ");
		buf.write(b"world");
		let (status, headers, body) = buf.flush();
		assert_eq!(status, StatusCode::OK);
		assert_eq!(&body[..], b"hello, world");
		assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "12");
	}

	#[test]
	fn set_body_replaces_buffered_writes() {
		let mut buf = ResponseBuffer::new();
		buf.write(b"stale");
		buf.set_body(Bytes::from_static(b"fresh"));
		let (_, _, body) = buf.flush();
		assert_eq!(&body[..], b"fresh");
	}

	#[test]
	fn flush_is_idempotent() {
		let mut buf = ResponseBuffer::new();
		buf.write(b"x");
		let first = buf.flush();
		buf.write(b"ignored-after-flush");
		let second = buf.flush();
		assert_eq!(first.2, second.2);
	}

	#[test]
	fn empty_body_has_no_content_length() {
		let mut buf = ResponseBuffer::new();
		let (_, headers, _) = buf.flush();
		assert!(headers.get(header::CONTENT_LENGTH).is_none());
	}
}
