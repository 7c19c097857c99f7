use std::collections::HashMap;

use http::Method;
use regex::Regex;
use uuid::Uuid;

use crate::errors::GatewayError;

/// A single path segment pattern (spec §4.1 "typed parameters").
#[derive(Clone, Debug)]
enum Segment {
	Literal(String),
	String(String),
	Int(String),
	Uuid(String),
	Slug(String),
	/// `{*rest}` — matches the remainder of the path, including slashes.
	PathRest(String),
}

/// A compiled host+path+method+header predicate plus the RouteID it
/// resolves to (spec §3 "Route", §4.1 "Router").
#[derive(Clone)]
pub struct CompiledRoute {
	pub route_id: String,
	hosts: Vec<String>,
	segments: Vec<Segment>,
	methods: Vec<Method>,
	required_headers: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct RouteSpec {
	pub route_id: String,
	pub hosts: Vec<String>,
	pub path_pattern: String,
	pub methods: Vec<String>,
	pub required_headers: Vec<(String, Option<String>)>,
}

fn compile_path(pattern: &str) -> Vec<Segment> {
	pattern
		.trim_matches('/')
		.split('/')
		.filter(|s| !s.is_empty())
		.map(|raw| {
			if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
				if let Some(name) = inner.strip_prefix('*') {
					Segment::PathRest(name.to_string())
				} else if let Some((name, ty)) = inner.split_once(':') {
					match ty {
						"int" => Segment::Int(name.to_string()),
						"uuid" => Segment::Uuid(name.to_string()),
						"slug" => Segment::Slug(name.to_string()),
						_ => Segment::String(name.to_string()),
					}
				} else {
					Segment::String(inner.to_string())
				}
			} else {
				Segment::Literal(raw.to_string())
			}
		})
		.collect()
}

static SLUG_RE: once_cell::sync::Lazy<Regex> =
	once_cell::sync::Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());

fn matches_typed(ty: &Segment, value: &str) -> bool {
	match ty {
		Segment::Int(_) => value.parse::<i64>().is_ok(),
		Segment::Uuid(_) => Uuid::parse_str(value).is_ok(),
		Segment::Slug(_) => SLUG_RE.is_match(value),
		Segment::String(_) | Segment::Literal(_) | Segment::PathRest(_) => true,
	}
}

impl CompiledRoute {
	pub fn compile(spec: &RouteSpec) -> Self {
		Self {
			route_id: spec.route_id.clone(),
			hosts: spec.hosts.clone(),
			segments: compile_path(&spec.path_pattern),
			methods: spec
				.methods
				.iter()
				.filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
				.collect(),
			required_headers: spec.required_headers.clone(),
		}
	}

	fn host_matches(&self, host: Option<&str>) -> bool {
		if self.hosts.is_empty() {
			return true;
		}
		let Some(host) = host else { return false };
		self.hosts.iter().any(|pattern| {
			if let Some(suffix) = pattern.strip_prefix("*.") {
				host.ends_with(suffix) && host.len() > suffix.len()
			} else {
				pattern == host
			}
		})
	}

	fn path_matches(&self, path: &str) -> Option<HashMap<String, String>> {
		let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
		let mut params = HashMap::new();
		let mut pi = 0usize;
		for seg in &self.segments {
			if let Segment::PathRest(name) = seg {
				let rest = parts.get(pi..)?.join("/");
				if !name.is_empty() {
					params.insert(name.clone(), rest);
				}
				return Some(params);
			}
			let part = parts.get(pi)?;
			match seg {
				Segment::Literal(lit) => {
					if lit != part {
						return None;
					}
				},
				Segment::String(name) | Segment::Int(name) | Segment::Uuid(name) | Segment::Slug(name) => {
					if !matches_typed(seg, part) {
						return None;
					}
					params.insert(name.clone(), part.to_string());
				},
				Segment::PathRest(_) => unreachable!(),
			}
			pi += 1;
		}
		if pi == parts.len() { Some(params) } else { None }
	}

	fn headers_match(&self, headers: &http::HeaderMap) -> bool {
		self.required_headers.iter().all(|(name, expected)| {
			headers.get(name).is_some_and(|value| {
				expected
					.as_ref()
					.map(|exp| value.to_str().map(|v| v == exp).unwrap_or(false))
					.unwrap_or(true)
			})
		})
	}
}

/// Ordered, compiled collection of routes. Construction is pure — a new
/// `Router` is built wholesale on every config reload and swapped in with
/// the rest of the `RouteState` (spec §4.1 "mutation only via RouteState
/// replacement").
#[derive(Clone, Default)]
pub struct Router {
	routes: Vec<CompiledRoute>,
}

pub struct Match {
	pub route_id: String,
	pub path_params: HashMap<String, String>,
}

impl Router {
	pub fn compile(specs: &[RouteSpec]) -> Self {
		Self {
			routes: specs.iter().map(CompiledRoute::compile).collect(),
		}
	}

	/// First match wins. Distinguishes 404 (no host/path match at all) from
	/// 405 (path matched some route but not by method) so callers can return
	/// the right status.
	pub fn match_request(
		&self,
		host: Option<&str>,
		path: &str,
		method: &Method,
		headers: &http::HeaderMap,
	) -> Result<Match, GatewayError> {
		let mut path_matched_any = false;
		for route in &self.routes {
			if !route.host_matches(host) {
				continue;
			}
			let Some(params) = route.path_matches(path) else {
				continue;
			};
			path_matched_any = true;
			if !route.methods.is_empty() && !route.methods.contains(method) {
				continue;
			}
			if !route.headers_match(headers) {
				continue;
			}
			return Ok(Match {
				route_id: route.route_id.clone(),
				path_params: params,
			});
		}
		if path_matched_any {
			Err(GatewayError::MethodNotAllowed)
		} else {
			Err(GatewayError::NoRoute)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(id: &str, path: &str, methods: &[&str]) -> RouteSpec {
		RouteSpec {
			route_id: id.to_string(),
			hosts: vec![],
			path_pattern: path.to_string(),
			methods: methods.iter().map(|s| s.to_string()).collect(),
			required_headers: vec![],
		}
	}

	#[test]
	fn matches_literal_path() {
		let router = Router::compile(&[spec("r1", "/healthz", &["GET"])]);
		let m = router
			.match_request(None, "/healthz", &Method::GET, &http::HeaderMap::new())
			.unwrap();
		assert_eq!(m.route_id, "r1");
	}

	#[test]
	fn extracts_typed_params() {
		let router = Router::compile(&[spec("r1", "/users/{id:int}", &["GET"])]);
		let m = router
			.match_request(None, "/users/42", &Method::GET, &http::HeaderMap::new())
			.unwrap();
		assert_eq!(m.path_params.get("id"), Some(&"42".to_string()));

		let err = router
			.match_request(None, "/users/abc", &Method::GET, &http::HeaderMap::new())
			.unwrap_err();
		assert!(matches!(err, GatewayError::NoRoute));
	}

	#[test]
	fn first_match_wins_and_method_mismatch_is_405() {
		let router = Router::compile(&[spec("r1", "/data", &["GET"]), spec("r2", "/data", &["POST"])]);
		let err = router
			.match_request(None, "/data", &Method::POST, &http::HeaderMap::new())
			.unwrap_err();
		assert!(matches!(err, GatewayError::MethodNotAllowed));
	}

	#[test]
	fn path_rest_captures_remainder() {
		let router = Router::compile(&[spec("r1", "/static/{*rest}", &["GET"])]);
		let m = router
			.match_request(None, "/static/a/b/c.js", &Method::GET, &http::HeaderMap::new())
			.unwrap();
		assert_eq!(m.path_params.get("rest"), Some(&"a/b/c.js".to_string()));
	}

	#[test]
	fn no_route_returns_not_found() {
		let router = Router::compile(&[spec("r1", "/data", &["GET"])]);
		let err = router
			.match_request(None, "/nope", &Method::GET, &http::HeaderMap::new())
			.unwrap_err();
		assert!(matches!(err, GatewayError::NoRoute));
	}
}
