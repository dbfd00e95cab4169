//! Structured service URLs.
//!
//! A [`ServiceUrl`] identifies one provider or consumer instance, e.g.
//! `dubbo://10.0.0.1:20880/com.foo.Service?version=1.0&group=blue`.  It is the
//! unit of registration and of subscription, and is used as a map key, so
//! equality and hashing cover every structured field.  Parameters live in a
//! sorted map so two URLs that differ only in query order compare equal.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Parameter holding the service interface when it differs from the path.
pub const INTERFACE_KEY: &str = "interface";
pub const GROUP_KEY: &str = "group";
pub const VERSION_KEY: &str = "version";
pub const CATEGORY_KEY: &str = "category";
pub const SIDE_KEY: &str = "side";

/// Wildcard accepted in a subscriber's group or version.
pub const ANY_VALUE: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid url {input:?}: {reason}")]
    Invalid { input: String, reason: String },

    #[error("url {0:?} has no host")]
    MissingHost(String),

    #[error("url {0:?} has no service interface")]
    MissingService(String),

    #[error("node name {0:?} is not valid percent-encoding")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Role segment of a registry path: `/<namespace>/<service>/<category>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Providers,
    Consumers,
    Routers,
    Configurators,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Providers => "providers",
            Self::Consumers => "consumers",
            Self::Routers => "routers",
            Self::Configurators => "configurators",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "providers" => Some(Self::Providers),
            "consumers" => Some(Self::Consumers),
            "routers" => Some(Self::Routers),
            "configurators" => Some(Self::Configurators),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ServiceUrl
// ---------------------------------------------------------------------------

/// Immutable structured identifier of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceUrl {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

impl ServiceUrl {
    pub fn new(protocol: &str, host: &str, port: u16, path: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            path: path.trim_start_matches('/').to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Return a copy with `key` set to `value`.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let parsed = url::Url::parse(input).map_err(|e| UrlError::Invalid {
            input: input.to_string(),
            reason: e.to_string(),
        })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| UrlError::MissingHost(input.to_string()))?;
        // IPv6 hosts come back bracketed.
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let path = urlencoding::decode(parsed.path().trim_start_matches('/'))
            .map_err(|_| UrlError::Encoding(input.to_string()))?
            .into_owned();

        let params: BTreeMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let url = Self {
            protocol: parsed.scheme().to_string(),
            host: host.to_string(),
            port: parsed.port().unwrap_or(0),
            path,
            params,
        };
        if url.service_interface().is_empty() {
            return Err(UrlError::MissingService(input.to_string()));
        }
        Ok(url)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `host:port`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The service interface: the `interface` parameter, else the path.
    pub fn service_interface(&self) -> &str {
        self.param(INTERFACE_KEY)
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.path)
    }

    pub fn group(&self) -> &str {
        self.param(GROUP_KEY).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.param(VERSION_KEY).unwrap_or("")
    }

    /// `group/interface:version`, omitting empty parts.
    pub fn service_key(&self) -> String {
        let mut key = String::new();
        if !self.group().is_empty() {
            key.push_str(self.group());
            key.push('/');
        }
        key.push_str(self.service_interface());
        if !self.version().is_empty() {
            key.push(':');
            key.push_str(self.version());
        }
        key
    }

    /// Category this URL registers under.
    ///
    /// An explicit `category` parameter wins; otherwise consumers (`side=consumer`)
    /// land in `consumers` and everything else in `providers`.
    pub fn category(&self) -> Category {
        if let Some(category) = self.param(CATEGORY_KEY).and_then(Category::parse) {
            return category;
        }
        match self.param(SIDE_KEY) {
            Some("consumer") => Category::Consumers,
            _ => Category::Providers,
        }
    }

    /// Category a subscriber with this URL watches; `providers` unless set.
    pub fn subscribed_category(&self) -> Category {
        self.param(CATEGORY_KEY)
            .and_then(Category::parse)
            .unwrap_or(Category::Providers)
    }

    /// Whether this (provider) URL should be delivered to `subscriber`.
    pub fn matches(&self, subscriber: &ServiceUrl) -> bool {
        if self.service_interface() != subscriber.service_interface() {
            return false;
        }
        let group_ok = match subscriber.group() {
            "" | ANY_VALUE => true,
            wanted => wanted.split(',').any(|g| g.trim() == self.group()),
        };
        let version_ok = match subscriber.version() {
            "" | ANY_VALUE => true,
            wanted => wanted == self.version(),
        };
        group_ok && version_ok
    }

    /// Percent-encoded full URL, used as a tree node name.
    pub fn encode(&self) -> String {
        urlencoding::encode(&self.to_string()).into_owned()
    }

    /// Inverse of [`ServiceUrl::encode`].
    pub fn decode(node: &str) -> Result<Self, UrlError> {
        let raw = urlencoding::decode(node).map_err(|_| UrlError::Encoding(node.to_string()))?;
        Self::parse(&raw)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.protocol,
            self.address(),
            urlencoding::encode(&self.path)
        )?;
        let mut sep = '?';
        for (k, v) in &self.params {
            write!(
                f,
                "{sep}{}={}",
                urlencoding::encode(k),
                urlencoding::encode(v)
            )?;
            sep = '&';
        }
        Ok(())
    }
}

impl FromStr for ServiceUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDER: &str = "dubbo://10.0.0.1:20880/com.foo.Service?version=1.0";

    #[test]
    fn parse_provider_url() {
        let url = ServiceUrl::parse(PROVIDER).unwrap();
        assert_eq!(url.protocol(), "dubbo");
        assert_eq!(url.host(), "10.0.0.1");
        assert_eq!(url.port(), 20880);
        assert_eq!(url.service_interface(), "com.foo.Service");
        assert_eq!(url.version(), "1.0");
        assert_eq!(url.category(), Category::Providers);
        assert_eq!(url.service_key(), "com.foo.Service:1.0");
    }

    #[test]
    fn equality_ignores_parameter_order() {
        let a = ServiceUrl::parse("dubbo://h:1/svc?a=1&b=2").unwrap();
        let b = ServiceUrl::parse("dubbo://h:1/svc?b=2&a=1").unwrap();
        assert_eq!(a, b);
        let c = ServiceUrl::parse("dubbo://h:1/svc?a=1&b=3").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn encode_decode_preserves_structure() {
        let url = ServiceUrl::parse("dubbo://10.0.0.1:20880/com.foo.Service?group=a b&version=1.0")
            .unwrap();
        let node = url.encode();
        assert!(!node.contains('/'));
        assert_eq!(ServiceUrl::decode(&node).unwrap(), url);
    }

    #[test]
    fn reserved_characters_in_path_survive_encoding() {
        let url =
            ServiceUrl::new("dubbo", "10.0.0.1", 20880, "a?b#c").with_param(VERSION_KEY, "1.0");
        assert_eq!(url.to_string(), "dubbo://10.0.0.1:20880/a%3Fb%23c?version=1.0");
        let decoded = ServiceUrl::decode(&url.encode()).unwrap();
        assert_eq!(decoded, url);
        assert_eq!(decoded.service_interface(), "a?b#c");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ServiceUrl::decode("not%20a%20url").is_err());
        assert!(ServiceUrl::decode("%FF%FE").is_err());
    }

    #[test]
    fn missing_host_is_rejected() {
        assert!(matches!(
            ServiceUrl::parse("dubbo:///com.foo.Service"),
            Err(UrlError::MissingHost(_)) | Err(UrlError::Invalid { .. })
        ));
    }

    #[test]
    fn consumer_side_defaults_to_consumers_category() {
        let url = ServiceUrl::parse("consumer://10.0.0.2/com.foo.Service?side=consumer").unwrap();
        assert_eq!(url.category(), Category::Consumers);
        assert_eq!(url.subscribed_category(), Category::Providers);

        let routers =
            ServiceUrl::parse("consumer://10.0.0.2/com.foo.Service?category=routers").unwrap();
        assert_eq!(routers.subscribed_category(), Category::Routers);
    }

    #[test]
    fn interface_param_overrides_path() {
        let url = ServiceUrl::parse("dubbo://h:1/anything?interface=com.bar.Api").unwrap();
        assert_eq!(url.service_interface(), "com.bar.Api");
    }

    #[test]
    fn provider_matching_honours_group_and_version() {
        let provider = ServiceUrl::parse("dubbo://h:1/com.foo.Service?group=blue&version=1.0")
            .unwrap();

        let any = ServiceUrl::parse("consumer://c/com.foo.Service").unwrap();
        assert!(provider.matches(&any));

        let wildcard = ServiceUrl::parse("consumer://c/com.foo.Service?group=*&version=*").unwrap();
        assert!(provider.matches(&wildcard));

        let groups = ServiceUrl::parse("consumer://c/com.foo.Service?group=red,blue").unwrap();
        assert!(provider.matches(&groups));

        let wrong_version =
            ServiceUrl::parse("consumer://c/com.foo.Service?version=2.0").unwrap();
        assert!(!provider.matches(&wrong_version));

        let other = ServiceUrl::parse("consumer://c/com.foo.Other").unwrap();
        assert!(!provider.matches(&other));
    }
}
