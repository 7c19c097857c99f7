//! GraphQL federation dispatcher (spec §4.8): schema merge at load time,
//! per-request field-ownership query splitting, concurrent sub-query
//! dispatch, response merging. The splitter uses a hand-written
//! brace-matching scan rather than a full GraphQL AST — see DESIGN.md's
//! Open Question decision for why that's an accepted limitation here.

use std::collections::HashMap;

use futures::future::join_all;
use serde_json::{Map, Value as Json};

#[derive(Clone, Debug)]
pub struct SubQuery {
	pub source_name: String,
	pub query: String,
	pub variables: Json,
}

/// `Root.fieldName -> sourceName`, built once at schema-merge time.
#[derive(Clone, Debug, Default)]
pub struct FieldOwner {
	map: HashMap<String, String>,
}

impl FieldOwner {
	pub fn insert(&mut self, root_field: impl Into<String>, source: impl Into<String>) {
		self.map.insert(root_field.into(), source.into());
	}

	pub fn owner_of(&self, field: &str) -> Option<&str> {
		self.map.get(field).map(String::as_str)
	}
}

/// One source's introspected root fields, keyed by operation root
/// (`Query`/`Mutation`/`Subscription`).
#[derive(Clone, Debug)]
pub struct SourceSchema {
	pub name: String,
	pub root_fields: HashMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
	#[error("field '{field}' is defined by both '{first}' and '{second}'")]
	Conflict { field: String, first: String, second: String },
}

/// Merges root field ownership across N source schemas. Field name
/// collisions across sources fail the merge (non-root type conflicts are
/// out of scope for the splitter and resolved first-source-wins upstream
/// of this function).
pub fn merge_schemas(sources: &[SourceSchema]) -> Result<FieldOwner, MergeError> {
	let mut owner = FieldOwner::default();
	for source in sources {
		for fields in source.root_fields.values() {
			for field in fields {
				if let Some(existing) = owner.owner_of(field) {
					if existing != source.name {
						return Err(MergeError::Conflict {
							field: field.clone(),
							first: existing.to_string(),
							second: source.name.clone(),
						});
					}
				}
				owner.insert(field.clone(), source.name.clone());
			}
		}
	}
	Ok(owner)
}

/// A minimal top-level-selection scanner: finds the operation keyword,
/// then walks the top-level `{ ... }` selection set splitting on brace
/// depth to find each field name and its full text span (including any
/// nested sub-selection, arguments, and aliases). Known not to handle
/// inline fragments or directives on top-level fields correctly.
fn split_top_level_fields(selection_set: &str) -> Vec<(String, String)> {
	let mut fields = Vec::new();
	let chars: Vec<char> = selection_set.chars().collect();
	let mut i = 0;
	while i < chars.len() {
		while i < chars.len() && (chars[i].is_whitespace() || chars[i] == ',') {
			i += 1;
		}
		if i >= chars.len() {
			break;
		}
		let start = i;
		while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == ':' || chars[i] == ' ') {
			i += 1;
		}
		let header: String = chars[start..i].iter().collect();
		let field_name = header
			.split(':')
			.next_back()
			.unwrap_or(&header)
			.trim()
			.split_whitespace()
			.next()
			.unwrap_or("")
			.to_string();
		if field_name.is_empty() {
			break;
		}
		let mut span_end = i;
		if i < chars.len() && chars[i] == '(' {
			let mut depth = 0;
			loop {
				match chars.get(i) {
					Some('(') => depth += 1,
					Some(')') => {
						depth -= 1;
						if depth == 0 {
							i += 1;
							span_end = i;
							break;
						}
					},
					None => break,
					_ => {},
				}
				i += 1;
			}
		}
		while i < chars.len() && chars[i].is_whitespace() {
			i += 1;
		}
		if i < chars.len() && chars[i] == '{' {
			let mut depth = 0;
			loop {
				match chars.get(i) {
					Some('{') => depth += 1,
					Some('}') => {
						depth -= 1;
						if depth == 0 {
							i += 1;
							span_end = i;
							break;
						}
					},
					None => break,
					_ => {},
				}
				i += 1;
			}
		}
		fields.push((field_name, chars[start..span_end].iter().collect::<String>().trim().to_string()));
	}
	fields
}

fn extract_selection_set(query: &str) -> Option<(&str, &str)> {
	let open = query.find('{')?;
	let close = query.rfind('}')?;
	if close <= open {
		return None;
	}
	Some((&query[..open], &query[open + 1..close]))
}

/// Splits an incoming query by field ownership. If every top-level field
/// belongs to the same source, returns that source's name with the
/// original query forwarded verbatim (spec §4.8 round-trip law). Otherwise
/// returns one synthesized sub-query per involved source, each containing
/// only its fields and the original operation's variables.
pub fn split_query(query: &str, owner: &FieldOwner, variables: &Json) -> Result<Vec<SubQuery>, String> {
	let (prefix, selection) = extract_selection_set(query).ok_or("query has no selection set")?;
	let operation_keyword = prefix
		.split_whitespace()
		.next()
		.filter(|w| matches!(*w, "query" | "mutation" | "subscription"))
		.unwrap_or("query");

	let fields = split_top_level_fields(selection);
	if fields.is_empty() {
		return Err("query has no top-level fields".to_string());
	}

	let mut by_source: Vec<(String, Vec<String>)> = Vec::new();
	for (name, span) in &fields {
		let source = owner.owner_of(name).ok_or_else(|| format!("no owner for field '{name}'"))?;
		match by_source.iter_mut().find(|(s, _)| s == source) {
			Some((_, spans)) => spans.push(span.clone()),
			None => by_source.push((source.to_string(), vec![span.clone()])),
		}
	}

	if let [(source_name, _)] = by_source.as_slice() {
		return Ok(vec![SubQuery {
			source_name: source_name.clone(),
			query: query.to_string(),
			variables: variables.clone(),
		}]);
	}

	Ok(by_source
		.into_iter()
		.map(|(source_name, spans)| SubQuery {
			source_name,
			query: format!("{operation_keyword} {{ {} }}", spans.join(" ")),
			variables: variables.clone(),
		})
		.collect())
}

#[derive(Debug, Clone)]
pub struct SubQueryResult {
	pub source_name: String,
	pub data: Option<Json>,
	pub error: Option<String>,
}

/// Merges sub-query results: unions top-level `data` keys (collisions are
/// impossible because owners are disjoint by construction) and
/// concatenates `errors`. A transport/parse failure for one source becomes
/// a GraphQL error entry without aborting the others (spec §4.8 "Failure
/// policy").
pub fn merge_results(results: Vec<SubQueryResult>) -> Json {
	let mut data = Map::new();
	let mut errors = Vec::new();
	for result in results {
		match result.data {
			Some(Json::Object(obj)) => data.extend(obj),
			Some(other) => errors.push(Json::String(format!("source '{}' returned non-object data: {other}", result.source_name))),
			None => {},
		}
		if let Some(e) = result.error {
			errors.push(Json::String(format!("source '{}': {e}", result.source_name)));
		}
	}
	let mut out = Map::new();
	if !data.is_empty() {
		out.insert("data".to_string(), Json::Object(data));
	}
	if !errors.is_empty() {
		out.insert("errors".to_string(), Json::Array(errors));
	}
	Json::Object(out)
}

/// Dispatches one POST per sub-query concurrently via `executor` and
/// merges the results. `executor` is injected so tests don't need a real
/// HTTP client; production code wires it to a `reqwest::Client` POST.
pub async fn execute_federated<F, Fut>(sub_queries: Vec<SubQuery>, executor: F) -> Json
where
	F: Fn(SubQuery) -> Fut,
	Fut: std::future::Future<Output = SubQueryResult>,
{
	let futures = sub_queries.into_iter().map(&executor);
	let results = join_all(futures).await;
	merge_results(results)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn owner() -> FieldOwner {
		let mut o = FieldOwner::default();
		o.insert("me", "users");
		o.insert("orders", "orders");
		o
	}

	#[test]
	fn single_source_query_is_forwarded_unmodified() {
		let owner = owner();
		let query = "{ me { id name } }";
		let subs = split_query(query, &owner, &Json::Null).unwrap();
		assert_eq!(subs.len(), 1);
		assert_eq!(subs[0].source_name, "users");
		assert_eq!(subs[0].query, query);
	}

	#[test]
	fn multi_source_query_splits_per_owner() {
		let owner = owner();
		let subs = split_query("{ me { id } orders { total } }", &owner, &Json::Null).unwrap();
		assert_eq!(subs.len(), 2);
		let sources: Vec<_> = subs.iter().map(|s| s.source_name.clone()).collect();
		assert!(sources.contains(&"users".to_string()));
		assert!(sources.contains(&"orders".to_string()));
	}

	#[test]
	fn variables_propagate_to_subqueries() {
		let owner = owner();
		let variables = serde_json::json!({ "limit": 5 });
		let single = split_query("{ me { id } }", &owner, &variables).unwrap();
		assert_eq!(single[0].variables, variables);

		let multi = split_query("{ me { id } orders { total } }", &owner, &variables).unwrap();
		assert!(multi.iter().all(|sq| sq.variables == variables));
	}

	#[tokio::test]
	async fn federated_execution_merges_disjoint_data() {
		let owner = owner();
		let subs = split_query("{ me { id } orders { total } }", &owner, &Json::Null).unwrap();
		let merged = execute_federated(subs, |sq| async move {
			let data = match sq.source_name.as_str() {
				"users" => serde_json::json!({ "me": { "id": "1" } }),
				"orders" => serde_json::json!({ "orders": { "total": 42 } }),
				_ => Json::Null,
			};
			SubQueryResult {
				source_name: sq.source_name,
				data: Some(data),
				error: None,
			}
		})
		.await;
		assert_eq!(merged["data"]["me"]["id"], "1");
		assert_eq!(merged["data"]["orders"]["total"], 42);
	}

	#[tokio::test]
	async fn failing_subquery_does_not_abort_others() {
		let owner = owner();
		let subs = split_query("{ me { id } orders { total } }", &owner, &Json::Null).unwrap();
		let merged = execute_federated(subs, |sq| async move {
			if sq.source_name == "orders" {
				SubQueryResult {
					source_name: sq.source_name,
					data: None,
					error: Some("connection refused".to_string()),
				}
			} else {
				SubQueryResult {
					source_name: sq.source_name,
					data: Some(serde_json::json!({ "me": { "id": "1" } })),
					error: None,
				}
			}
		})
		.await;
		assert_eq!(merged["data"]["me"]["id"], "1");
		assert!(merged["errors"][0].as_str().unwrap().contains("connection refused"));
	}

	#[test]
	fn schema_merge_detects_field_conflict() {
		let sources = vec![
			SourceSchema {
				name: "a".into(),
				root_fields: HashMap::from([("Query".to_string(), vec!["shared".to_string()])]),
			},
			SourceSchema {
				name: "b".into(),
				root_fields: HashMap::from([("Query".to_string(), vec!["shared".to_string()])]),
			},
		];
		assert!(merge_schemas(&sources).is_err());
	}
}
