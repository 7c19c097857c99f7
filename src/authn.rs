//! JWT bearer-token authentication backing the `auth` pipeline slot's
//! full verification path (spec §4.2.1): fetches a JWKS once at setup,
//! refreshes it on an interval, and validates a token's signature,
//! issuer and audience.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use serde_json::map::Map;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum AuthError {
	InvalidToken(jsonwebtoken::errors::Error),
}

#[derive(Debug)]
pub enum JwkError {
	JwksFetchError(reqwest::Error),
	JwksFileError(std::io::Error),
	JwksParseError(serde_json::Error),
	InvalidJwk(jsonwebtoken::errors::Error),
	UnsupportedAlgorithm,
	InvalidConfig(String),
}

/// Authenticated claims plus the raw token, kept as a `SecretString` so it
/// never leaks through a `Debug` impl.
pub struct Claims {
	pub claims: Map<String, Value>,
	pub raw_token: SecretString,
}

impl Claims {
	pub fn new(claims: Map<String, Value>, raw_token: SecretString) -> Self {
		Self { claims, raw_token }
	}
}

#[derive(Clone, Serialize)]
struct JwksRemoteSource {
	#[serde(skip_serializing)]
	client: reqwest::Client,
	url: String,
	refresh_interval: Duration,
}

impl JwksRemoteSource {
	fn new(url: String, refresh_interval: Duration) -> Result<Self, JwkError> {
		let client = reqwest::ClientBuilder::new()
			.timeout(Duration::from_secs(10))
			.build()
			.map_err(JwkError::JwksFetchError)?;
		Ok(Self { client, url, refresh_interval })
	}

	async fn fetch_jwks(&self) -> Result<Jwk, JwkError> {
		let response = self.client.get(&self.url).send().await.map_err(JwkError::JwksFetchError)?;
		let text = response.text().await.map_err(JwkError::JwksFetchError)?;
		serde_json::from_str(&text).map_err(JwkError::JwksParseError)
	}
}

/// Wraps a `DecodingKey` behind a lock so `sync_jwks_loop` can hot-swap it
/// without requiring callers to reacquire the authenticator.
struct MutableKey {
	key: DecodingKey,
}

impl MutableKey {
	fn update(&mut self, key: DecodingKey) {
		self.key = key;
	}
}

#[derive(Clone, Serialize)]
pub struct JwtAuthenticator {
	#[serde(skip_serializing)]
	key: Arc<RwLock<MutableKey>>,
	issuer: Option<HashSet<String>>,
	audience: Option<HashSet<String>>,
	remote: Option<JwksRemoteSource>,
}

impl std::fmt::Debug for JwtAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "JwtAuthenticator {{ issuer: {:?}, audience: {:?} }}", self.issuer, self.audience)
	}
}

impl JwtAuthenticator {
	/// Builds an authenticator from a JWKS URL, fetching the first key
	/// synchronously so setup fails fast on a bad config (spec §4.9 step 1).
	pub async fn from_jwks_url(url: impl Into<String>, issuer: HashSet<String>, audience: HashSet<String>) -> Result<Self, JwkError> {
		let remote = JwksRemoteSource::new(url.into(), Duration::from_secs(300))?;
		let jwk = remote.fetch_jwks().await?;
		Self::from_jwk(jwk, Some(remote), issuer, audience)
	}

	fn from_jwk(jwk: Jwk, remote: Option<JwksRemoteSource>, issuer: HashSet<String>, audience: HashSet<String>) -> Result<Self, JwkError> {
		if !jwk.is_supported() {
			return Err(JwkError::UnsupportedAlgorithm);
		}
		let key = DecodingKey::from_jwk(&jwk).map_err(JwkError::InvalidJwk)?;
		Ok(Self {
			key: Arc::new(RwLock::new(MutableKey { key })),
			issuer: (!issuer.is_empty()).then_some(issuer),
			audience: (!audience.is_empty()).then_some(audience),
			remote,
		})
	}

	pub async fn sync_jwks(&self) -> Result<(), JwkError> {
		let Some(remote) = &self.remote else { return Ok(()) };
		let jwk = remote.fetch_jwks().await?;
		let key = DecodingKey::from_jwk(&jwk).map_err(JwkError::InvalidJwk)?;
		self.key.write().await.update(key);
		Ok(())
	}

	pub async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
		let header = decode_header(token).map_err(AuthError::InvalidToken)?;
		let mut validation = Validation::new(header.alg);
		validation.aud = self.audience.clone();
		validation.iss = self.issuer.clone();

		let key = self.key.read().await;
		let token_data = decode::<Map<String, Value>>(token, &key.key, &validation).map_err(AuthError::InvalidToken)?;
		Ok(Claims::new(token_data.claims, SecretString::new(token.into())))
	}
}

/// Background task refreshing `authenticator`'s JWKS on its configured
/// interval until cancelled.
pub async fn sync_jwks_loop(authenticator: Arc<JwtAuthenticator>, ct: CancellationToken) {
	let interval = authenticator.remote.as_ref().map(|r| r.refresh_interval).unwrap_or(Duration::from_secs(300));
	loop {
		tokio::select! {
			_ = ct.cancelled() => {
				tracing::info!("cancelled sync_jwks_loop");
				return;
			},
			_ = tokio::time::sleep(interval) => {
				if let Err(e) = authenticator.sync_jwks().await {
					tracing::error!("error syncing jwks: {:?}", e);
				}
			}
		}
	}
}
