//! Credential strategies applied to every outgoing request attempt.

use crate::error::{Error, ErrorCode};
use async_trait::async_trait;
use http::header::{AUTHORIZATION, HeaderName};
use http::{HeaderMap, HeaderValue};
use std::future::Future;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Applies credentials to an outgoing request.
///
/// Invoked once per attempt, so retries and pagination follow-ups always
/// carry a freshly resolved credential.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Insert authentication headers.
    ///
    /// # Errors
    ///
    /// Returns an `AuthRequired` error when no usable credential is available.
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), Error>;

    /// Called once after a 401. Return `true` when the next
    /// [`authenticate`](Self::authenticate) will apply a different credential;
    /// the request is then sent once more.
    ///
    /// # Errors
    ///
    /// A failed refresh is logged and the 401 is returned to the caller.
    async fn refresh(&self) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Source of bearer access tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token. Implementations may refresh it.
    ///
    /// # Errors
    ///
    /// Any error is surfaced to the caller as `AuthRequired`.
    async fn access_token(&self) -> Result<Zeroizing<String>, Error>;

    /// Renew the token after the server rejected it with a 401.
    ///
    /// Returns whether a new token is now available. The default cannot
    /// renew anything.
    ///
    /// # Errors
    ///
    /// Returns the refresh failure; the caller then sees the original 401.
    async fn refresh(&self) -> Result<bool, Error> {
        Ok(false)
    }
}

/// A fixed access token.
pub struct StaticToken(Zeroizing<String>);

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<Zeroizing<String>, Error> {
        Ok(self.0.clone())
    }
}

struct FnTokenProvider<F>(F);

#[async_trait]
impl<F, Fut> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, Error>> + Send,
{
    async fn access_token(&self) -> Result<Zeroizing<String>, Error> {
        (self.0)().await.map(Zeroizing::new)
    }

    // The closure runs again on the next attempt.
    async fn refresh(&self) -> Result<bool, Error> {
        Ok(true)
    }
}

/// `Authorization: Bearer <token>` from a [`TokenProvider`].
#[derive(Clone)]
pub struct BearerAuth {
    provider: Arc<dyn TokenProvider>,
}

impl BearerAuth {
    /// Bearer auth with a fixed token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_provider(StaticToken::new(token))
    }

    #[must_use]
    pub fn with_provider(provider: impl TokenProvider + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    /// Bearer auth whose token is fetched by `f` before every attempt.
    ///
    /// ```ignore
    /// let auth = BearerAuth::refreshing(move || {
    ///     let store = store.clone();
    ///     async move { store.current_token().await }
    /// });
    /// ```
    #[must_use]
    pub fn refreshing<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, Error>> + Send + 'static,
    {
        Self::with_provider(FnTokenProvider(f))
    }
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthStrategy for BearerAuth {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        let token = self.provider.access_token().await.map_err(|e| {
            if e.code() == ErrorCode::AuthRequired {
                e
            } else {
                Error::new(ErrorCode::AuthRequired, "Failed to obtain access token")
                    .with_hint(e.message().to_owned())
                    .with_source(e)
            }
        })?;
        if token.trim().is_empty() {
            return Err(Error::new(ErrorCode::AuthRequired, "Access token is empty")
                .with_hint("Check or refresh your access token"));
        }

        let mut raw = Zeroizing::new(String::with_capacity(token.len() + 7));
        raw.push_str("Bearer ");
        raw.push_str(&token);
        let mut value = HeaderValue::from_str(&raw).map_err(|_| {
            Error::new(ErrorCode::AuthRequired, "Access token contains invalid characters")
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    async fn refresh(&self) -> Result<bool, Error> {
        self.provider.refresh().await
    }
}

/// A caller-chosen header, for cookie or API-key schemes.
#[derive(Clone)]
pub struct HeaderAuth {
    name: HeaderName,
    value: HeaderValue,
}

impl HeaderAuth {
    /// # Errors
    ///
    /// Returns a `Usage` error if the name or value is not a valid header.
    pub fn new(name: &str, value: impl AsRef<str>) -> Result<Self, Error> {
        let name = HeaderName::try_from(name)
            .map_err(|e| Error::usage(format!("Invalid auth header name: {name}")).with_source(e))?;
        let mut value = HeaderValue::from_str(value.as_ref())
            .map_err(|e| Error::usage("Invalid auth header value").with_source(e))?;
        value.set_sensitive(true);
        Ok(Self { name, value })
    }
}

impl std::fmt::Debug for HeaderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderAuth")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthStrategy for HeaderAuth {
    async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), Error> {
        headers.insert(self.name.clone(), self.value.clone());
        Ok(())
    }
}
