//! Storage account identification
//!
//! An account can be named three ways: a bare account name, a public endpoint URL such as
//! `https://acct.blob.core.windows.net`, or a private-endpoint host such as
//! `acct.privatelink.blob.core.windows.net`. All three normalize to the same [`AccountRef`]
//! before any network call. Private endpoints are reached through the public host name,
//! which the private DNS zone resolves to the endpoint address.

use enum_map::Enum;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_SUFFIX: &str = "core.windows.net";
const PRIVATE_LINK_LABEL: &str = "privatelink";

/// Storage data-plane kind.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Enum,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    Blob,
    Queue,
    Table,
    FileShare,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Blob, Kind::Queue, Kind::Table, Kind::FileShare];

    /// Host label of the service endpoint.
    pub fn service(self) -> &'static str {
        match self {
            Kind::Blob => "blob",
            Kind::Queue => "queue",
            Kind::Table => "table",
            Kind::FileShare => "file",
        }
    }

    /// What a top-level resource of this kind is called.
    pub fn resource_noun(self) -> &'static str {
        match self {
            Kind::Blob => "container",
            Kind::Queue => "queue",
            Kind::Table => "table",
            Kind::FileShare => "share",
        }
    }

    fn from_service(service: &str) -> Option<Kind> {
        Kind::ALL.into_iter().find(|kind| kind.service() == service)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Blob => "blob",
            Kind::Queue => "queue",
            Kind::Table => "table",
            Kind::FileShare => "file-share",
        })
    }
}

/// A storage account endpoint for one data-plane kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountRef {
    name: String,
    kind: Kind,
    suffix: String,
}

impl AccountRef {
    /// Parses any of the accepted identifier forms for `kind`.
    pub fn parse(input: &str, kind: Kind) -> Result<Self, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::configuration(kind, "empty account identifier"));
        }
        if input.contains("://") {
            return Self::parse_url(input, kind);
        }
        let host = input.strip_suffix('/').unwrap_or(input);
        if host.contains('/') || host.contains('?') {
            return Err(Error::configuration(
                kind,
                format!("{input:?} must not contain a path or query"),
            ));
        }
        if host.contains('.') {
            return Self::parse_host(host, kind);
        }
        let name = validate_name(host, kind)?;
        Ok(Self {
            name,
            kind,
            suffix: DEFAULT_SUFFIX.to_string(),
        })
    }

    fn parse_url(input: &str, kind: Kind) -> Result<Self, Error> {
        let url = url::Url::parse(input)
            .map_err(|err| Error::configuration(kind, format!("invalid URL {input:?}: {err}")))?;
        if url.scheme() != "https" {
            return Err(Error::configuration(
                kind,
                format!("{input:?} must use https"),
            ));
        }
        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::configuration(
                kind,
                format!("{input:?} must not contain a path or query"),
            ));
        }
        if url.port().is_some() || !url.username().is_empty() {
            return Err(Error::configuration(
                kind,
                format!("{input:?} must be a plain account endpoint"),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::configuration(kind, format!("{input:?} has no host")))?;
        Self::parse_host(host, kind)
    }

    fn parse_host(host: &str, kind: Kind) -> Result<Self, Error> {
        let host = host.to_ascii_lowercase();
        let mut labels = host.split('.');
        let name = labels.next().unwrap_or_default();
        let mut service = labels.next().unwrap_or_default();
        if service == PRIVATE_LINK_LABEL {
            service = labels.next().unwrap_or_default();
        }
        let suffix = labels.collect::<Vec<_>>().join(".");
        if service != kind.service() {
            let reason = match Kind::from_service(service) {
                Some(other) => format!(
                    "{host:?} is a {other} endpoint, expected a {} endpoint",
                    kind.service()
                ),
                None => format!("{host:?} is not a {} endpoint", kind.service()),
            };
            return Err(Error::configuration(kind, reason));
        }
        if suffix.is_empty() || suffix.split('.').any(str::is_empty) {
            return Err(Error::configuration(
                kind,
                format!("{host:?} has no endpoint suffix"),
            ));
        }
        Ok(Self {
            name: validate_name(name, kind)?,
            kind,
            suffix,
        })
    }

    pub fn from_parts(name: &str, kind: Kind, suffix: &str) -> Result<Self, Error> {
        Self::parse_host(&format!("{name}.{}.{suffix}", kind.service()), kind)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn host(&self) -> String {
        format!("{}.{}.{}", self.name, self.kind.service(), self.suffix)
    }

    pub fn endpoint(&self) -> String {
        format!("https://{}/", self.host())
    }
}

impl std::fmt::Display for AccountRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host())
    }
}

fn validate_name(name: &str, kind: Kind) -> Result<String, Error> {
    let valid = (3..=24).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if valid {
        Ok(name.to_string())
    } else {
        Err(Error::configuration(
            kind,
            format!("{name:?} is not a valid account name (3-24 lowercase letters and digits)"),
        ))
    }
}

/// A file-share connection string carrying a shared access signature.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub account: AccountRef,
    sas: String,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let kind = Kind::FileShare;
        let mut sas = None;
        let mut file_endpoint = None;
        let mut account_name = None;
        let mut suffix = None;
        for part in input.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::configuration(kind, "connection string parts must be Key=Value")
            })?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "sharedaccesssignature" => sas = Some(value.trim_start_matches('?').to_string()),
                "fileendpoint" => file_endpoint = Some(value),
                "accountname" => account_name = Some(value),
                "endpointsuffix" => suffix = Some(value),
                "defaultendpointsprotocol" if !value.eq_ignore_ascii_case("https") => {
                    return Err(Error::configuration(
                        kind,
                        "connection string protocol must be https",
                    ));
                }
                "accountkey" => {
                    return Err(Error::configuration(
                        kind,
                        "account key connection strings are not supported, use a shared access signature",
                    ));
                }
                _ => {}
            }
        }
        let sas = sas.filter(|sas| !sas.is_empty()).ok_or_else(|| {
            Error::configuration(kind, "connection string has no SharedAccessSignature")
        })?;
        let account = match (file_endpoint, account_name) {
            (Some(endpoint), _) => AccountRef::parse(endpoint, kind)?,
            (None, Some(name)) => {
                AccountRef::from_parts(name, kind, suffix.unwrap_or(DEFAULT_SUFFIX))?
            }
            (None, None) => {
                return Err(Error::configuration(
                    kind,
                    "connection string names neither FileEndpoint nor AccountName",
                ));
            }
        };
        Ok(Self { account, sas })
    }

    /// The signature as a query string, without the leading `?`.
    pub fn sas(&self) -> &str {
        &self.sas
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("account", &self.account)
            .field("sas", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_forms_are_equivalent() {
        for kind in Kind::ALL {
            let bare = AccountRef::parse("acct", kind).unwrap();
            let public =
                AccountRef::parse(&format!("https://acct.{}.core.windows.net", kind.service()), kind)
                    .unwrap();
            let private = AccountRef::parse(
                &format!("acct.privatelink.{}.core.windows.net", kind.service()),
                kind,
            )
            .unwrap();
            assert_eq!(bare, public);
            assert_eq!(bare, private);
            assert_eq!(
                bare.endpoint(),
                format!("https://acct.{}.core.windows.net/", kind.service())
            );
        }
    }

    #[test]
    fn url_forms_tolerate_case_and_trailing_slash() {
        let account = AccountRef::parse("https://ACCT.Blob.core.windows.net/", Kind::Blob).unwrap();
        assert_eq!(account.name(), "acct");
        let private =
            AccountRef::parse("https://acct.privatelink.blob.core.windows.net", Kind::Blob).unwrap();
        assert_eq!(account, private);
    }

    #[test]
    fn sovereign_suffix_is_preserved() {
        let account = AccountRef::parse("https://acct.table.core.chinacloudapi.cn", Kind::Table).unwrap();
        assert_eq!(account.suffix(), "core.chinacloudapi.cn");
        assert_eq!(account.host(), "acct.table.core.chinacloudapi.cn");
    }

    #[test]
    fn rejects_wrong_service() {
        let err = AccountRef::parse("https://acct.queue.core.windows.net", Kind::Blob).unwrap_err();
        assert!(err.to_string().contains("queue endpoint"), "{err}");
        assert!(AccountRef::parse("acct.dfs.core.windows.net", Kind::Blob).is_err());
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for input in [
            "",
            "ab",
            "Acct_1",
            "waytoolongaccountname12345",
            "http://acct.blob.core.windows.net",
            "https://acct.blob.core.windows.net/container",
            "https://acct.blob.core.windows.net/?sv=2020",
            "https://acct.blob.core.windows.net:8443",
            "acct.blob.core.windows.net/container",
            "acct.blob",
        ] {
            assert!(AccountRef::parse(input, Kind::Blob).is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn connection_string_with_endpoint() {
        let parsed = ConnectionString::parse(
            "FileEndpoint=https://acct.file.core.windows.net/;SharedAccessSignature=sv=2022-11-02&sig=abc%3D",
        )
        .unwrap();
        assert_eq!(parsed.account, AccountRef::parse("acct", Kind::FileShare).unwrap());
        assert_eq!(parsed.sas(), "sv=2022-11-02&sig=abc%3D");
        assert!(!format!("{parsed:?}").contains("sig=abc"));
    }

    #[test]
    fn connection_string_with_account_name() {
        let parsed = ConnectionString::parse(
            "DefaultEndpointsProtocol=https;AccountName=acct;EndpointSuffix=core.usgovcloudapi.net;SharedAccessSignature=?sv=1&sig=x",
        )
        .unwrap();
        assert_eq!(parsed.account.host(), "acct.file.core.usgovcloudapi.net");
        assert_eq!(parsed.sas(), "sv=1&sig=x");
    }

    #[test]
    fn connection_string_requires_signature() {
        let err = ConnectionString::parse("AccountName=acct;AccountKey=Zm9v").unwrap_err();
        assert!(err.to_string().contains("not supported"), "{err}");
        assert!(ConnectionString::parse("AccountName=acct").is_err());
        assert!(ConnectionString::parse("SharedAccessSignature=sv=1").is_err());
    }
}
