//! Credentials, authentication challenges and trust overrides

use std::collections::BTreeSet;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Credential material answering an authentication challenge.
///
/// Each variant renders the matching `Authorization` header value.
///
/// # Examples
///
/// ```rust
/// use ferry::Credential;
///
/// assert_eq!(Credential::basic("user", "pass").to_header_value(), "Basic dXNlcjpwYXNz");
/// assert_eq!(Credential::bearer("token123").to_header_value(), "Bearer token123");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// HTTP Basic authentication with username and password.
    Basic {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token authentication (OAuth, JWT, etc.).
    Bearer {
        /// Bearer token
        token: String,
    },
    /// `Authorization: <scheme> <credentials>` with an arbitrary scheme.
    Custom {
        /// Authentication scheme (e.g., "ApiKey", "Digest")
        scheme: String,
        /// Credentials for the scheme
        credentials: String,
    },
}

impl Credential {
    /// Create HTTP Basic credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Create a bearer token credential.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Create a credential with a custom scheme.
    pub fn custom(scheme: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self::Custom {
            scheme: scheme.into(),
            credentials: credentials.into(),
        }
    }

    /// Render the `Authorization` header value.
    pub fn to_header_value(&self) -> String {
        match self {
            Credential::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
            Credential::Bearer { token } => format!("Bearer {}", token),
            Credential::Custom {
                scheme,
                credentials,
            } => format!("{} {}", scheme, credentials),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credential::Bearer { .. } => f.debug_struct("Bearer").finish_non_exhaustive(),
            Credential::Custom { scheme, .. } => f
                .debug_struct("Custom")
                .field("scheme", scheme)
                .finish_non_exhaustive(),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Basic { username, .. } => {
                write!(f, "Basic authentication for user: {}", username)
            }
            Credential::Bearer { .. } => write!(f, "Bearer token authentication"),
            Credential::Custom { scheme, .. } => write!(f, "Custom {} authentication", scheme),
        }
    }
}

/// A server request for authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Host that issued the challenge
    pub host: String,
    /// Authentication scheme, e.g. `Basic`
    pub scheme: String,
    /// Protection realm, if the server named one
    pub realm: Option<String>,
    /// How many credentials were already rejected for this exchange
    pub previous_failure_count: u32,
}

impl Challenge {
    /// Parse the first challenge of a `WWW-Authenticate` header value.
    pub(crate) fn parse(host: &str, header: &str, previous_failure_count: u32) -> Option<Self> {
        let header = header.trim();
        if header.is_empty() {
            return None;
        }

        let (scheme, params) = match header.split_once(char::is_whitespace) {
            Some((scheme, params)) => (scheme, params),
            None => (header, ""),
        };

        let realm = params.split(',').find_map(|param| {
            let (name, value) = param.trim().split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_string())
        });

        Some(Self {
            host: host.to_string(),
            scheme: scheme.to_string(),
            realm,
            previous_failure_count,
        })
    }
}

/// Certificate trust overrides for one operation.
///
/// Either flag weakens transport security for the hosts it covers and is
/// never enabled by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Accept any certificate from any host
    pub trust_all_hosts: bool,
    /// Accept any certificate from these hosts
    pub trusted_hosts: BTreeSet<String>,
}

impl TrustPolicy {
    /// Whether certificate validation is waived for `host`.
    pub fn trusts(&self, host: &str) -> bool {
        self.trust_all_hosts
            || self
                .trusted_hosts
                .iter()
                .any(|trusted| trusted.eq_ignore_ascii_case(host))
    }
}
