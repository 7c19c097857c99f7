//! Expression-driven policy language (spec §4.3). A `CompiledRule` compiles
//! its expression text once at route load; `RuleEngine::evaluate` walks the
//! compiled rules in order against a typed `RequestEnv`/`ResponseEnv` and
//! yields `Action`s whose side effects the caller applies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, warn};

use crate::response::ResponseBuffer;
use crate::variables::{SkipFlags, VariableContext};

// ---------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct RequestEnv {
	pub method: String,
	pub path: String,
	pub headers: HashMap<String, String>,
	pub query: HashMap<String, String>,
	pub remote_addr: String,
	pub route_id: String,
	pub tenant_id: Option<String>,
	pub client_id: Option<String>,
	pub custom: HashMap<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct ResponseEnv {
	pub request: RequestEnv,
	pub code: u16,
	pub response_headers: HashMap<String, String>,
	pub response_time_ms: u64,
}

enum EnvRef<'a> {
	Request(&'a RequestEnv),
	Response(&'a ResponseEnv),
}

// ---------------------------------------------------------------------
// Values + expression AST
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	Num(f64),
	Str(String),
	List(Vec<Value>),
}

impl Value {
	fn as_bool(&self) -> Option<bool> {
		match self {
			Value::Bool(b) => Some(*b),
			_ => None,
		}
	}

	fn truthy_cmp_str(&self) -> String {
		match self {
			Value::Str(s) => s.clone(),
			Value::Num(n) => n.to_string(),
			Value::Bool(b) => b.to_string(),
			Value::Null => String::new(),
			Value::List(_) => String::new(),
		}
	}
}

#[derive(Clone, Debug)]
enum PathPart {
	Ident(String),
	Index(String),
}

#[derive(Clone, Copy, Debug)]
enum BinOp {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	And,
	Or,
	In,
	Contains,
}

#[derive(Clone, Debug)]
enum Expr {
	Lit(Value),
	Path(Vec<PathPart>),
	Not(Box<Expr>),
	Bin(BinOp, Box<Expr>, Box<Expr>),
	List(Vec<Expr>),
}

// ---------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Tok {
	Ident(String),
	Str(String),
	Num(f64),
	Op(String),
	LParen,
	RParen,
	LBracket,
	RBracket,
	Dot,
	Comma,
	End,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
	let mut chars = src.chars().peekable();
	let mut toks = Vec::new();
	while let Some(&c) = chars.peek() {
		match c {
			' ' | '\t' | '\n' | '\r' => {
				chars.next();
			},
			'(' => {
				chars.next();
				toks.push(Tok::LParen);
			},
			')' => {
				chars.next();
				toks.push(Tok::RParen);
			},
			'[' => {
				chars.next();
				toks.push(Tok::LBracket);
			},
			']' => {
				chars.next();
				toks.push(Tok::RBracket);
			},
			'.' => {
				chars.next();
				toks.push(Tok::Dot);
			},
			',' => {
				chars.next();
				toks.push(Tok::Comma);
			},
			'"' | '\'' => {
				let quote = c;
				chars.next();
				let mut s = String::new();
				loop {
					match chars.next() {
						Some(ch) if ch == quote => break,
						Some(ch) => s.push(ch),
						None => return Err("unterminated string literal".into()),
					}
				}
				toks.push(Tok::Str(s));
			},
			'=' | '!' | '<' | '>' | '&' | '|' => {
				let mut op = String::new();
				op.push(c);
				chars.next();
				if let Some(&next) = chars.peek() {
					if (c == '=' && next == '=')
						|| (c == '!' && next == '=')
						|| (c == '<' && next == '=')
						|| (c == '>' && next == '=')
						|| (c == '&' && next == '&')
						|| (c == '|' && next == '|')
					{
						op.push(next);
						chars.next();
					}
				}
				toks.push(Tok::Op(op));
			},
			c if c.is_ascii_digit() => {
				let mut s = String::new();
				while let Some(&d) = chars.peek() {
					if d.is_ascii_digit() || d == '.' {
						s.push(d);
						chars.next();
					} else {
						break;
					}
				}
				toks.push(Tok::Num(s.parse().map_err(|_| format!("bad number literal {s}"))?));
			},
			c if c.is_alphabetic() || c == '_' => {
				let mut s = String::new();
				while let Some(&d) = chars.peek() {
					if d.is_alphanumeric() || d == '_' {
						s.push(d);
						chars.next();
					} else {
						break;
					}
				}
				toks.push(Tok::Ident(s));
			},
			other => return Err(format!("unexpected character '{other}'")),
		}
	}
	toks.push(Tok::End);
	Ok(toks)
}

// ---------------------------------------------------------------------
// Parser (recursive descent, standard precedence: || < && < cmp < unary < primary)
// ---------------------------------------------------------------------

struct Parser {
	toks: Vec<Tok>,
	pos: usize,
}

impl Parser {
	fn peek(&self) -> &Tok {
		&self.toks[self.pos]
	}

	fn advance(&mut self) -> Tok {
		let t = self.toks[self.pos].clone();
		if self.pos + 1 < self.toks.len() {
			self.pos += 1;
		}
		t
	}

	fn expect_op(&mut self, op: &str) -> bool {
		if let Tok::Op(o) = self.peek() {
			if o == op {
				self.advance();
				return true;
			}
		}
		false
	}

	fn parse_expr(&mut self) -> Result<Expr, String> {
		self.parse_or()
	}

	fn parse_or(&mut self) -> Result<Expr, String> {
		let mut lhs = self.parse_and()?;
		loop {
			if self.expect_op("||") {
				let rhs = self.parse_and()?;
				lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
			} else {
				break;
			}
		}
		Ok(lhs)
	}

	fn parse_and(&mut self) -> Result<Expr, String> {
		let mut lhs = self.parse_cmp()?;
		loop {
			if self.expect_op("&&") {
				let rhs = self.parse_cmp()?;
				lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
			} else {
				break;
			}
		}
		Ok(lhs)
	}

	fn parse_cmp(&mut self) -> Result<Expr, String> {
		let lhs = self.parse_unary()?;
		let op = match self.peek().clone() {
			Tok::Op(o) => match o.as_str() {
				"==" => Some(BinOp::Eq),
				"!=" => Some(BinOp::Ne),
				"<" => Some(BinOp::Lt),
				"<=" => Some(BinOp::Le),
				">" => Some(BinOp::Gt),
				">=" => Some(BinOp::Ge),
				_ => None,
			},
			Tok::Ident(ref id) if id == "in" => Some(BinOp::In),
			Tok::Ident(ref id) if id == "contains" => Some(BinOp::Contains),
			_ => None,
		};
		let Some(op) = op else { return Ok(lhs) };
		self.advance();
		let rhs = match op {
			BinOp::In => self.parse_list_or_unary()?,
			_ => self.parse_unary()?,
		};
		Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)))
	}

	fn parse_list_or_unary(&mut self) -> Result<Expr, String> {
		if matches!(self.peek(), Tok::LBracket) {
			self.advance();
			let mut items = Vec::new();
			if !matches!(self.peek(), Tok::RBracket) {
				loop {
					items.push(self.parse_unary()?);
					if matches!(self.peek(), Tok::Comma) {
						self.advance();
					} else {
						break;
					}
				}
			}
			if !matches!(self.peek(), Tok::RBracket) {
				return Err("expected ']'".into());
			}
			self.advance();
			Ok(Expr::List(items))
		} else {
			self.parse_unary()
		}
	}

	fn parse_unary(&mut self) -> Result<Expr, String> {
		if self.expect_op("!") {
			return Ok(Expr::Not(Box::new(self.parse_unary()?)));
		}
		self.parse_primary()
	}

	fn parse_primary(&mut self) -> Result<Expr, String> {
		match self.advance() {
			Tok::Str(s) => Ok(Expr::Lit(Value::Str(s))),
			Tok::Num(n) => Ok(Expr::Lit(Value::Num(n))),
			Tok::Ident(id) if id == "true" => Ok(Expr::Lit(Value::Bool(true))),
			Tok::Ident(id) if id == "false" => Ok(Expr::Lit(Value::Bool(false))),
			Tok::Ident(id) => self.parse_path(id),
			Tok::LParen => {
				let inner = self.parse_expr()?;
				if !matches!(self.peek(), Tok::RParen) {
					return Err("expected ')'".into());
				}
				self.advance();
				Ok(inner)
			},
			other => Err(format!("unexpected token {other:?}")),
		}
	}

	fn parse_path(&mut self, first: String) -> Result<Expr, String> {
		let mut parts = vec![PathPart::Ident(first)];
		loop {
			match self.peek() {
				Tok::Dot => {
					self.advance();
					match self.advance() {
						Tok::Ident(id) => parts.push(PathPart::Ident(id)),
						other => return Err(format!("expected identifier after '.', got {other:?}")),
					}
				},
				Tok::LBracket => {
					self.advance();
					let key = match self.advance() {
						Tok::Str(s) => s,
						other => return Err(format!("expected string index, got {other:?}")),
					};
					if !matches!(self.peek(), Tok::RBracket) {
						return Err("expected ']'".into());
					}
					self.advance();
					parts.push(PathPart::Index(key));
				},
				_ => break,
			}
		}
		Ok(Expr::Path(parts))
	}
}

fn parse(src: &str) -> Result<Expr, String> {
	let toks = tokenize(src)?;
	let mut parser = Parser { toks, pos: 0 };
	let expr = parser.parse_expr()?;
	if !matches!(parser.peek(), Tok::End) {
		return Err(format!("unexpected trailing tokens starting at {:?}", parser.peek()));
	}
	Ok(expr)
}

// ---------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------

fn resolve_path(parts: &[PathPart], env: &EnvRef) -> Value {
	let idents: Vec<&str> = parts
		.iter()
		.filter_map(|p| match p {
			PathPart::Ident(s) => Some(s.as_str()),
			PathPart::Index(_) => None,
		})
		.collect();
	let index_for = |pos: usize| -> Option<&str> {
		match parts.get(pos) {
			Some(PathPart::Index(s)) => Some(s.as_str()),
			_ => None,
		}
	};

	let (request, response_code, response_headers, response_time_ms) = match env {
		EnvRef::Request(r) => (*r, None, None, None),
		EnvRef::Response(r) => (&r.request, Some(r.code), Some(&r.response_headers), Some(r.response_time_ms)),
	};

	match idents.as_slice() {
		["http", "request", "method"] => Value::Str(request.method.clone()),
		["http", "request", "path"] => Value::Str(request.path.clone()),
		["http", "request", "remote"] => Value::Str(request.remote_addr.clone()),
		["http", "request", "headers"] => {
			let Some(key) = index_for(3) else { return Value::Null };
			request
				.headers
				.get(&key.to_ascii_lowercase())
				.map(|v| Value::Str(v.clone()))
				.unwrap_or(Value::Null)
		},
		["http", "request", "query"] => {
			let Some(key) = index_for(3) else { return Value::Null };
			request.query.get(key).map(|v| Value::Str(v.clone())).unwrap_or(Value::Null)
		},
		["http", "response", "code"] => response_code.map(|c| Value::Num(c as f64)).unwrap_or(Value::Null),
		["http", "response", "time_ms"] => response_time_ms.map(|t| Value::Num(t as f64)).unwrap_or(Value::Null),
		["http", "response", "headers"] => {
			let Some(key) = index_for(3) else { return Value::Null };
			response_headers
				.and_then(|h| h.get(&key.to_ascii_lowercase()))
				.map(|v| Value::Str(v.clone()))
				.unwrap_or(Value::Null)
		},
		["ctx", "route_id"] => Value::Str(request.route_id.clone()),
		["ctx", "tenant_id"] => request.tenant_id.clone().map(Value::Str).unwrap_or(Value::Null),
		["ctx", "client_id"] => request.client_id.clone().map(Value::Str).unwrap_or(Value::Null),
		["ctx", "custom"] => {
			let Some(key) = index_for(2) else { return Value::Null };
			request
				.custom
				.get(key)
				.map(|v| json_to_value(v))
				.unwrap_or(Value::Null)
		},
		_ => Value::Null,
	}
}

fn json_to_value(v: &serde_json::Value) -> Value {
	match v {
		serde_json::Value::Bool(b) => Value::Bool(*b),
		serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or_default()),
		serde_json::Value::String(s) => Value::Str(s.clone()),
		serde_json::Value::Array(a) => Value::List(a.iter().map(json_to_value).collect()),
		_ => Value::Null,
	}
}

fn eval(expr: &Expr, env: &EnvRef) -> Result<Value, String> {
	match expr {
		Expr::Lit(v) => Ok(v.clone()),
		Expr::Path(parts) => Ok(resolve_path(parts, env)),
		Expr::List(items) => Ok(Value::List(
			items.iter().map(|e| eval(e, env)).collect::<Result<_, _>>()?,
		)),
		Expr::Not(inner) => {
			let v = eval(inner, env)?;
			v.as_bool().map(|b| Value::Bool(!b)).ok_or_else(|| "'!' requires a bool operand".to_string())
		},
		Expr::Bin(op, lhs, rhs) => {
			match op {
				BinOp::And => {
					let l = eval(lhs, env)?.as_bool().ok_or("'&&' requires bool operands")?;
					if !l {
						return Ok(Value::Bool(false));
					}
					let r = eval(rhs, env)?.as_bool().ok_or("'&&' requires bool operands")?;
					return Ok(Value::Bool(l && r));
				},
				BinOp::Or => {
					let l = eval(lhs, env)?.as_bool().ok_or("'||' requires bool operands")?;
					if l {
						return Ok(Value::Bool(true));
					}
					let r = eval(rhs, env)?.as_bool().ok_or("'||' requires bool operands")?;
					return Ok(Value::Bool(l || r));
				},
				_ => {},
			}
			let l = eval(lhs, env)?;
			let r = eval(rhs, env)?;
			match op {
				BinOp::Eq => Ok(Value::Bool(l == r)),
				BinOp::Ne => Ok(Value::Bool(l != r)),
				BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
					let (ln, rn) = match (&l, &r) {
						(Value::Num(a), Value::Num(b)) => (*a, *b),
						_ => return Err("ordering operators require numeric operands".into()),
					};
					Ok(Value::Bool(match op {
						BinOp::Lt => ln < rn,
						BinOp::Le => ln <= rn,
						BinOp::Gt => ln > rn,
						BinOp::Ge => ln >= rn,
						_ => unreachable!(),
					}))
				},
				BinOp::In => match r {
					Value::List(items) => Ok(Value::Bool(items.contains(&l))),
					_ => Err("'in' requires a list on the right-hand side".into()),
				},
				BinOp::Contains => {
					let hay = l.truthy_cmp_str();
					let needle = r.truthy_cmp_str();
					Ok(Value::Bool(hay.contains(&needle)))
				},
				BinOp::And | BinOp::Or => unreachable!(),
			}
		},
	}
}

// ---------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Action {
	Block { status: Option<u16>, body: Option<String> },
	CustomResponse { status: Option<u16>, body: Option<String> },
	Redirect { status: Option<u16>, url: String },
	SetHeaders { add: Vec<(String, String)>, set: Vec<(String, String)>, remove: Vec<String> },
	Rewrite { path: Option<String>, query: Option<String>, headers: Vec<(String, String)> },
	Group(String),
	Log(Option<String>),
	Delay(Duration),
	SetVar(HashMap<String, serde_json::Value>),
	CacheBypass,
	Lua(String),
	SetStatus(u16),
	SetBody(String),
	SkipAuth,
	SkipRateLimit,
	SkipThrottle,
	SkipCircuitBreaker,
	SkipWaf,
	SkipValidation,
	SkipCompression,
	SkipAdaptiveConcurrency,
	SkipBodyLimit,
	SkipMirror,
	SkipAccessLog,
	SkipCacheStore,
	RateLimitTier(String),
	TimeoutOverride(Duration),
	PriorityOverride(i32),
	BandwidthOverride(u64),
	BodyLimitOverride(u64),
	SwitchBackend(String),
	CacheTtlOverride(Duration),
}

impl Action {
	pub fn is_terminating(&self) -> bool {
		matches!(self, Action::Block { .. } | Action::CustomResponse { .. } | Action::Redirect { .. })
	}

	fn skip_flag(&self) -> Option<SkipFlags> {
		match self {
			Action::SkipAuth => Some(SkipFlags::AUTH),
			Action::SkipRateLimit => Some(SkipFlags::RATE_LIMIT),
			Action::SkipThrottle => Some(SkipFlags::THROTTLE),
			Action::SkipCircuitBreaker => Some(SkipFlags::CIRCUIT_BREAKER),
			Action::SkipWaf => Some(SkipFlags::WAF),
			Action::SkipValidation => Some(SkipFlags::VALIDATION),
			Action::SkipCompression => Some(SkipFlags::COMPRESSION),
			Action::SkipAdaptiveConcurrency => Some(SkipFlags::ADAPTIVE_CONCURRENCY),
			Action::SkipBodyLimit => Some(SkipFlags::BODY_LIMIT),
			Action::SkipMirror => Some(SkipFlags::MIRROR),
			Action::SkipAccessLog => Some(SkipFlags::ACCESS_LOG),
			Action::SkipCacheStore => Some(SkipFlags::CACHE_STORE),
			_ => None,
		}
	}

	/// Applies a non-terminating action's side effect. Terminating actions
	/// are handled by the caller directly since they also need to stop the
	/// loop.
	pub fn apply(&self, ctx: &mut VariableContext, resp: &mut ResponseBuffer) {
		if let Some(flag) = self.skip_flag() {
			ctx.skip_flags.set(flag);
			return;
		}
		match self {
			Action::SetHeaders { add, set, remove } => {
				for (k, v) in add {
					if let (Ok(name), Ok(value)) = (
						http::HeaderName::try_from(k.as_str()),
						http::HeaderValue::from_str(v),
					) {
						resp.headers_mut().append(name, value);
					}
				}
				for (k, v) in set {
					if let (Ok(name), Ok(value)) = (
						http::HeaderName::try_from(k.as_str()),
						http::HeaderValue::from_str(v),
					) {
						resp.headers_mut().insert(name, value);
					}
				}
				for k in remove {
					if let Ok(name) = http::HeaderName::try_from(k.as_str()) {
						resp.headers_mut().remove(name);
					}
				}
			},
			Action::Group(name) => ctx.traffic_group = Some(name.clone()),
			Action::Log(msg) => {
				tracing::info!(route_id = ?ctx.route_id, message = msg.as_deref().unwrap_or(""), "rule log action");
			},
			Action::SetVar(map) => ctx.custom_merge(map.clone()),
			Action::CacheBypass => ctx.skip_flags.set(SkipFlags::CACHE_STORE),
			Action::SetStatus(code) => {
				if let Ok(status) = http::StatusCode::from_u16(*code) {
					resp.set_status_code(status);
				}
			},
			Action::SetBody(body) => resp.set_body(body.clone().into_bytes()),
			Action::RateLimitTier(tier) => ctx.overrides_mut().rate_limit_tier = Some(tier.clone()),
			Action::TimeoutOverride(d) => ctx.overrides_mut().timeout_override = Some(*d),
			Action::PriorityOverride(p) => ctx.overrides_mut().priority_override = Some(*p),
			Action::BandwidthOverride(b) => ctx.overrides_mut().bandwidth_override = Some(*b),
			Action::BodyLimitOverride(b) => ctx.overrides_mut().body_limit_override = Some(*b),
			Action::SwitchBackend(name) => ctx.overrides_mut().switch_backend = Some(name.clone()),
			Action::CacheTtlOverride(d) => ctx.overrides_mut().cache_ttl_override = Some(*d),
			// Delay/Rewrite/Lua handled by the pipeline assembler directly since
			// they need async suspension or request-URL mutation it owns.
			Action::Delay(_) | Action::Rewrite { .. } | Action::Lua(_) => {},
			Action::Block { .. } | Action::CustomResponse { .. } | Action::Redirect { .. } => unreachable!(
				"terminating actions must be handled by the caller before apply()"
			),
		}
	}
}

/// Decodes a rule's `action` config value into the typed `Action`. The
/// config shape is a tagged object, `{"type": "block", "status": 403}`,
/// so a rule file stays plain JSON/YAML without needing an Action
/// `Deserialize` impl that would have to special-case every skip variant.
pub fn action_from_json(value: &serde_json::Value) -> Result<Action, String> {
	let obj = value.as_object().ok_or("action must be an object")?;
	let ty = obj.get("type").and_then(|v| v.as_str()).ok_or("action is missing a 'type' field")?;
	let str_field = |k: &str| obj.get(k).and_then(|v| v.as_str()).map(str::to_string);
	let u16_field = |k: &str| obj.get(k).and_then(|v| v.as_u64()).map(|v| v as u16);
	let u64_field = |k: &str| obj.get(k).and_then(|v| v.as_u64());
	let millis_field = |k: &str| u64_field(k).map(Duration::from_millis);
	let pairs = |k: &str| -> Vec<(String, String)> {
		obj.get(k)
			.and_then(|v| v.as_object())
			.map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string()))).collect())
			.unwrap_or_default()
	};
	let strings = |k: &str| -> Vec<String> {
		obj.get(k).and_then(|v| v.as_array()).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default()
	};

	Ok(match ty {
		"block" => Action::Block { status: u16_field("status"), body: str_field("body") },
		"custom_response" => Action::CustomResponse { status: u16_field("status"), body: str_field("body") },
		"redirect" => Action::Redirect { status: u16_field("status"), url: str_field("url").ok_or("redirect action requires 'url'")? },
		"set_headers" => Action::SetHeaders { add: pairs("add"), set: pairs("set"), remove: strings("remove") },
		"rewrite" => Action::Rewrite { path: str_field("path"), query: str_field("query"), headers: pairs("headers") },
		"group" => Action::Group(str_field("name").ok_or("group action requires 'name'")?),
		"log" => Action::Log(str_field("message")),
		"delay" => Action::Delay(millis_field("ms").ok_or("delay action requires 'ms'")?),
		"set_var" => Action::SetVar(obj.get("vars").and_then(|v| v.as_object()).map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default()),
		"cache_bypass" => Action::CacheBypass,
		"lua" => Action::Lua(str_field("script").ok_or("lua action requires 'script'")?),
		"set_status" => Action::SetStatus(u16_field("code").ok_or("set_status action requires 'code'")?),
		"set_body" => Action::SetBody(str_field("body").unwrap_or_default()),
		"skip_auth" => Action::SkipAuth,
		"skip_rate_limit" => Action::SkipRateLimit,
		"skip_throttle" => Action::SkipThrottle,
		"skip_circuit_breaker" => Action::SkipCircuitBreaker,
		"skip_waf" => Action::SkipWaf,
		"skip_validation" => Action::SkipValidation,
		"skip_compression" => Action::SkipCompression,
		"skip_adaptive_concurrency" => Action::SkipAdaptiveConcurrency,
		"skip_body_limit" => Action::SkipBodyLimit,
		"skip_mirror" => Action::SkipMirror,
		"skip_access_log" => Action::SkipAccessLog,
		"skip_cache_store" => Action::SkipCacheStore,
		"rate_limit_tier" => Action::RateLimitTier(str_field("tier").ok_or("rate_limit_tier action requires 'tier'")?),
		"timeout_override" => Action::TimeoutOverride(millis_field("ms").ok_or("timeout_override action requires 'ms'")?),
		"priority_override" => Action::PriorityOverride(obj.get("priority").and_then(|v| v.as_i64()).ok_or("priority_override action requires 'priority'")? as i32),
		"bandwidth_override" => Action::BandwidthOverride(u64_field("bytes_per_sec").ok_or("bandwidth_override action requires 'bytes_per_sec'")?),
		"body_limit_override" => Action::BodyLimitOverride(u64_field("bytes").ok_or("body_limit_override action requires 'bytes'")?),
		"switch_backend" => Action::SwitchBackend(str_field("backend").ok_or("switch_backend action requires 'backend'")?),
		"cache_ttl_override" => Action::CacheTtlOverride(millis_field("ms").ok_or("cache_ttl_override action requires 'ms'")?),
		other => return Err(format!("unknown action type '{other}'")),
	})
}

// ---------------------------------------------------------------------
// Compiled rule + engine
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct CompiledRule {
	pub id: String,
	pub expression_text: String,
	program: Expr,
	pub action: Action,
	pub enabled: bool,
}

impl CompiledRule {
	pub fn compile(id: impl Into<String>, expression_text: impl Into<String>, action: Action) -> Result<Self, String> {
		let expression_text = expression_text.into();
		let program = parse(&expression_text)?;
		if let StaticType::Known(ty) = static_type(&program)? {
			if ty != ValueType::Bool {
				return Err(format!("rule expression must evaluate to bool, found a statically {ty:?} expression"));
			}
		}
		Ok(Self {
			id: id.into(),
			expression_text,
			program,
			action,
			enabled: true,
		})
	}
}

// ---------------------------------------------------------------------
// Static typing (spec §4.2 "rule compilation must reject a non-bool
// top-level expression"). Only literals and the fixed `http.*`/`ctx.*`
// paths whose shape doesn't depend on runtime data can be typed without an
// environment; index lookups (`headers[...]`, `custom[...]`) and anything
// else stay `Unknown` and are accepted, since a genuine type can only be
// known once evaluated against real request data.
// ---------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ValueType {
	Bool,
	Str,
	Num,
	Null,
	List,
}

enum StaticType {
	Known(ValueType),
	Unknown,
}

fn known_path_type(parts: &[PathPart]) -> StaticType {
	let idents: Vec<&str> = parts
		.iter()
		.filter_map(|p| match p {
			PathPart::Ident(s) => Some(s.as_str()),
			PathPart::Index(_) => None,
		})
		.collect();
	match idents.as_slice() {
		["http", "request", "method"] => StaticType::Known(ValueType::Str),
		["http", "request", "path"] => StaticType::Known(ValueType::Str),
		["http", "request", "remote"] => StaticType::Known(ValueType::Str),
		["ctx", "route_id"] => StaticType::Known(ValueType::Str),
		_ => StaticType::Unknown,
	}
}

fn expect_bool_operand(ty: &StaticType, op: &str) -> Result<(), String> {
	if let StaticType::Known(found) = ty {
		if *found != ValueType::Bool {
			return Err(format!("'{op}' requires a bool operand, found a statically {found:?} expression"));
		}
	}
	Ok(())
}

fn static_type(expr: &Expr) -> Result<StaticType, String> {
	match expr {
		Expr::Lit(Value::Bool(_)) => Ok(StaticType::Known(ValueType::Bool)),
		Expr::Lit(Value::Str(_)) => Ok(StaticType::Known(ValueType::Str)),
		Expr::Lit(Value::Num(_)) => Ok(StaticType::Known(ValueType::Num)),
		Expr::Lit(Value::Null) => Ok(StaticType::Known(ValueType::Null)),
		Expr::Lit(Value::List(_)) => Ok(StaticType::Known(ValueType::List)),
		Expr::List(_) => Ok(StaticType::Known(ValueType::List)),
		Expr::Path(parts) => Ok(known_path_type(parts)),
		Expr::Not(inner) => {
			expect_bool_operand(&static_type(inner)?, "!")?;
			Ok(StaticType::Known(ValueType::Bool))
		},
		Expr::Bin(op, lhs, rhs) => {
			let lt = static_type(lhs)?;
			let rt = static_type(rhs)?;
			match op {
				BinOp::And => {
					expect_bool_operand(&lt, "&&")?;
					expect_bool_operand(&rt, "&&")?;
					Ok(StaticType::Known(ValueType::Bool))
				},
				BinOp::Or => {
					expect_bool_operand(&lt, "||")?;
					expect_bool_operand(&rt, "||")?;
					Ok(StaticType::Known(ValueType::Bool))
				},
				BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::In | BinOp::Contains => Ok(StaticType::Known(ValueType::Bool)),
			}
		},
	}
}

#[derive(Default)]
pub struct RuleMetrics {
	pub evaluated: AtomicU64,
	pub errors: AtomicU64,
	pub matched: AtomicU64,
}

/// Holds the global and per-route compiled rules for one phase direction;
/// a route owns one `RuleEngine` for request rules and one for response
/// rules (spec: "ResponseEnv for response-phase").
#[derive(Default)]
pub struct RuleEngine {
	pub global: Vec<CompiledRule>,
	pub route: Vec<CompiledRule>,
	pub metrics: RuleMetrics,
}

pub enum EvalOutcome {
	/// No terminating rule fired; the list of non-terminating actions that
	/// were already applied, in order.
	Continue,
	/// A terminating rule fired; the loop stopped before evaluating any
	/// subsequent rule in this phase.
	Terminated { rule_id: String },
}

impl RuleEngine {
	/// Evaluates global rules first, then per-route, against `env`. Applies
	/// every non-terminating action's side effect as it goes; stops at the
	/// first terminating rule and writes its response into `resp`.
	pub fn evaluate(&self, env_request: Option<&RequestEnv>, env_response: Option<&ResponseEnv>, ctx: &mut VariableContext, resp: &mut ResponseBuffer) -> EvalOutcome {
		let env = match (env_request, env_response) {
			(_, Some(r)) => EnvRef::Response(r),
			(Some(r), None) => EnvRef::Request(r),
			(None, None) => return EvalOutcome::Continue,
		};
		for rule in self.global.iter().chain(self.route.iter()) {
			if !rule.enabled {
				continue;
			}
			self.metrics.evaluated.fetch_add(1, Ordering::Relaxed);
			let result = eval(&rule.program, &env);
			let value = match result {
				Ok(v) => v,
				Err(e) => {
					self.metrics.errors.fetch_add(1, Ordering::Relaxed);
					warn!(rule_id = %rule.id, error = %e, "rule evaluation error, skipping");
					continue;
				},
			};
			let Some(true) = value.as_bool() else { continue };
			self.metrics.matched.fetch_add(1, Ordering::Relaxed);
			if rule.action.is_terminating() {
				write_terminating(&rule.action, resp);
				return EvalOutcome::Terminated { rule_id: rule.id.clone() };
			}
			rule.action.apply(ctx, resp);
		}
		EvalOutcome::Continue
	}
}

fn write_terminating(action: &Action, resp: &mut ResponseBuffer) {
	match action {
		Action::Block { status, body } => {
			let code = status.unwrap_or(403);
			let status = http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::FORBIDDEN);
			resp.set_status_code(status);
			let body = body
				.clone()
				.unwrap_or_else(|| status.canonical_reason().unwrap_or("Forbidden").to_string());
			resp.set_body(body.into_bytes());
			resp.headers_mut().insert(
				http::header::CONTENT_TYPE,
				http::HeaderValue::from_static("text/plain"),
			);
		},
		Action::CustomResponse { status, body } => {
			let code = status.unwrap_or(200);
			resp.set_status_code(http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::OK));
			resp.set_body(body.clone().unwrap_or_default().into_bytes());
		},
		Action::Redirect { status, url } => {
			let code = status.unwrap_or(302);
			resp.set_status_code(http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::FOUND));
			if let Ok(value) = http::HeaderValue::from_str(url) {
				resp.headers_mut().insert(http::header::LOCATION, value);
			}
		},
		_ => error!("write_terminating called with a non-terminating action"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn req_env() -> RequestEnv {
		let mut headers = HashMap::new();
		headers.insert("content-type".to_string(), "application/json".to_string());
		RequestEnv {
			method: "POST".to_string(),
			path: "/data".to_string(),
			headers,
			query: HashMap::new(),
			remote_addr: "1.2.3.4".to_string(),
			route_id: "r1".to_string(),
			tenant_id: None,
			client_id: None,
			custom: HashMap::new(),
		}
	}

	#[test]
	fn equality_on_method() {
		let expr = parse("http.request.method == \"POST\"").unwrap();
		let env = req_env();
		let v = eval(&expr, &EnvRef::Request(&env)).unwrap();
		assert_eq!(v, Value::Bool(true));
	}

	#[test]
	fn header_index_lookup() {
		let expr = parse("http.request.headers[\"Content-Type\"] == \"application/json\"").unwrap();
		let env = req_env();
		assert_eq!(eval(&expr, &EnvRef::Request(&env)).unwrap(), Value::Bool(true));
	}

	#[test]
	fn boolean_connectives_short_circuit() {
		let expr = parse("http.request.method == \"POST\" && http.request.path == \"/data\"").unwrap();
		let env = req_env();
		assert_eq!(eval(&expr, &EnvRef::Request(&env)).unwrap(), Value::Bool(true));
	}

	#[test]
	fn in_operator() {
		let expr = parse("http.request.method in [\"GET\", \"POST\"]").unwrap();
		let env = req_env();
		assert_eq!(eval(&expr, &EnvRef::Request(&env)).unwrap(), Value::Bool(true));
	}

	#[test]
	fn terminating_block_stops_chain() {
		let mut engine = RuleEngine::default();
		engine.global.push(
			CompiledRule::compile("g1", "http.request.method == \"POST\"", Action::Block {
				status: Some(403),
				body: None,
			})
			.unwrap(),
		);
		engine.route.push(
			CompiledRule::compile("r1", "true", Action::Log(Some("should not run".into()))).unwrap(),
		);
		let mut ctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = req_env();
		let outcome = engine.evaluate(Some(&env), None, &mut ctx, &mut resp);
		assert!(matches!(outcome, EvalOutcome::Terminated { .. }));
		let (status, _, body) = resp.flush();
		assert_eq!(status, http::StatusCode::FORBIDDEN);
		assert_eq!(&body[..], b"Forbidden");
	}

	#[test]
	fn non_terminating_action_sets_traffic_group() {
		let mut engine = RuleEngine::default();
		engine.route.push(CompiledRule::compile("r1", "true", Action::Group("canary".into())).unwrap());
		let mut ctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = req_env();
		let outcome = engine.evaluate(Some(&env), None, &mut ctx, &mut resp);
		assert!(matches!(outcome, EvalOutcome::Continue));
		assert_eq!(ctx.traffic_group.as_deref(), Some("canary"));
	}

	#[test]
	fn non_bool_expression_fails_to_compile() {
		// `http.request.method` alone evaluates to a Str, not a Bool.
		let result = CompiledRule::compile("r1", "http.request.method", Action::Log(None));
		assert!(result.is_err());
	}

	#[test]
	fn dynamic_path_expression_is_accepted_at_compile_time() {
		// `ctx.custom[...]` can hold any JSON type at runtime, so it can't be
		// rejected statically; a non-bool result is instead a non-match.
		let mut engine = RuleEngine::default();
		engine.route.push(CompiledRule::compile("r1", "ctx.custom[\"flag\"]", Action::Log(None)).unwrap());
		let mut ctx = VariableContext::default();
		let mut resp = ResponseBuffer::new();
		let env = req_env();
		let outcome = engine.evaluate(Some(&env), None, &mut ctx, &mut resp);
		assert!(matches!(outcome, EvalOutcome::Continue));
	}

	#[test]
	fn action_from_json_decodes_block() {
		let action = action_from_json(&serde_json::json!({"type": "block", "status": 451, "body": "nope"})).unwrap();
		assert!(matches!(action, Action::Block { status: Some(451), .. }));
	}

	#[test]
	fn action_from_json_decodes_timeout_override() {
		let action = action_from_json(&serde_json::json!({"type": "timeout_override", "ms": 2500})).unwrap();
		assert!(matches!(action, Action::TimeoutOverride(d) if d == Duration::from_millis(2500)));
	}

	#[test]
	fn action_from_json_rejects_unknown_type() {
		assert!(action_from_json(&serde_json::json!({"type": "not_a_real_action"})).is_err());
	}

	#[test]
	fn action_from_json_rejects_missing_required_field() {
		assert!(action_from_json(&serde_json::json!({"type": "redirect"})).is_err());
	}
}
