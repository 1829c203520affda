#![forbid(unsafe_code)]

pub mod endpoint {
	use url::Url;

	/// Parsed `ws://` or `wss://` stream endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct StreamEndpoint {
		url: Url,
	}

	impl StreamEndpoint {
		/// Parse a stream endpoint string in the form `ws[s]://host[:port][/path][?query]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host or wss://host)".to_string());
			}

			let url = Url::parse(s).map_err(|e| format!("invalid endpoint ({e}): {s}"))?;

			match url.scheme() {
				"ws" | "wss" => {}
				other => {
					return Err(format!("invalid endpoint scheme {other:?} (expected ws or wss): {s}"));
				}
			}

			let host = url.host_str().unwrap_or_default();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected ws[s]://host): {s}"));
			}

			if url.port() == Some(0) {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			if url.fragment().is_some() {
				return Err(format!("invalid endpoint (fragments are not allowed): {s}"));
			}

			Ok(Self { url })
		}

		pub fn url(&self) -> &Url {
			&self.url
		}

		pub fn as_str(&self) -> &str {
			self.url.as_str()
		}

		/// Returns `host:port`, filling in the scheme's default port.
		pub fn hostport(&self) -> String {
			let port = self
				.url
				.port_or_known_default()
				.unwrap_or(if self.is_tls() { 443 } else { 80 });
			format!("{}:{}", self.url.host_str().unwrap_or_default(), port)
		}

		pub fn is_tls(&self) -> bool {
			self.url.scheme() == "wss"
		}
	}

	impl std::fmt::Display for StreamEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.write_str(self.url.as_str())
		}
	}

	/// Validate `ws[s]://host...`.
	pub fn validate_stream_endpoint(s: &str) -> Result<(), String> {
		let _ = StreamEndpoint::parse(s)?;
		Ok(())
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Milliseconds since the Unix epoch for `t` (0 for pre-epoch times).
	#[inline]
	pub fn unix_ms(t: SystemTime) -> i64 {
		t.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		unix_ms(SystemTime::now())
	}

	/// Inverse of [`unix_ms`]; negative values clamp to the epoch.
	pub fn from_unix_ms(ms: i64) -> SystemTime {
		UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn epoch_is_zero() {
			assert_eq!(unix_ms(UNIX_EPOCH), 0);
		}

		#[test]
		fn from_unix_ms_inverts_unix_ms() {
			let t = from_unix_ms(1_700_000_000_123);
			assert_eq!(unix_ms(t), 1_700_000_000_123);
			assert_eq!(from_unix_ms(-5), UNIX_EPOCH);
		}
	}
}
