use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::token::TokenRefresher;
use crate::config::GOOGLE_TOKEN_URI;
use crate::error::CredentialError;

// Tokens this close to expiry are treated as already expired.
fn refresh_threshold() -> Duration {
    Duration::seconds(3 * 60 + 45)
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// An OAuth2 user credential in Google's "authorized user" JSON layout.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "token", default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, deserialize_with = "scopes_format::deserialize")]
    pub scopes: Vec<String>,
    #[serde(default, with = "expiry_format")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    // An expiry too close to the representable minimum counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| {
            expiry
                .checked_sub_signed(refresh_threshold())
                .map_or(true, |deadline| now >= deadline)
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some() && !self.is_expired_at(now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("expiry", &self.expiry)
            .finish()
    }
}

mod scopes_format {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scopes {
        List(Vec<String>),
        Joined(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Scopes>::deserialize(deserializer)? {
            Some(Scopes::List(scopes)) => scopes,
            Some(Scopes::Joined(scopes)) => {
                scopes.split_whitespace().map(str::to_string).collect()
            }
            None => Vec::new(),
        })
    }
}

mod expiry_format {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(expiry: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match expiry {
            Some(expiry) => {
                serializer.serialize_str(&expiry.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            None => serializer.serialize_none(),
        }
    }

    // Accepts RFC 3339 as well as the naive UTC timestamps some writers emit.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = match Option::<String>::deserialize(deserializer)? {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(None),
        };
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(parsed.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(|e| de::Error::custom(format!("invalid expiry {raw:?}: {e}")))
    }
}

/// Reads the credential record at `path`.
///
/// A non-empty `scopes` replaces the scopes stored in the record. No network
/// access happens here; see [`validate_or_refresh`].
pub async fn load(path: &Path, scopes: &[String]) -> Result<Credential, CredentialError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CredentialError::NotFound(path.to_path_buf()))
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(CredentialError::Invalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
        Err(e) => return Err(CredentialError::io(path, e)),
    };

    let mut credential = Credential::from_json(&contents).map_err(|e| CredentialError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !scopes.is_empty() {
        credential.scopes = scopes.to_vec();
    }
    debug!("Loaded credentials from {}", path.display());
    Ok(credential)
}

/// Returns a usable credential, refreshing it once if it has expired.
pub async fn validate_or_refresh<R>(
    credential: Credential,
    refresher: &R,
) -> Result<Credential, CredentialError>
where
    R: TokenRefresher + ?Sized,
{
    if credential.is_valid() {
        debug!("The stored access token is still valid");
        return Ok(credential);
    }
    if !credential.can_refresh() {
        return Err(CredentialError::Unrefreshable);
    }
    info!("The stored access token has expired, refreshing it");
    let refreshed = refresher.refresh(&credential).await?;
    info!("Successfully refreshed the access token");
    Ok(refreshed)
}

/// Writes the credential record to `path`, replacing any previous one.
///
/// The record goes to a sibling temporary file first and is renamed into
/// place, so a reader sees either the old or the new record.
pub async fn save(credential: &Credential, path: &Path) -> Result<(), CredentialError> {
    let json = credential
        .to_json()
        .map_err(|e| CredentialError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CredentialError::io(parent, e))?;
    }

    let tmp_path = temp_path(path);
    if let Err(e) = write_private(&tmp_path, json.as_bytes()).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(CredentialError::io(path, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(CredentialError::io(path, e));
    }
    debug!("Saved credentials to {}", path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "credentials".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

// The file is created owner-only, so the tokens are never readable by others.
async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    // A stale temp file keeps its old mode; start from a fresh one.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail_api::token::MockTokenRefresher;
    use chrono::TimeZone;

    fn credential(access_token: Option<&str>, refresh_token: Option<&str>) -> Credential {
        Credential {
            access_token: access_token.map(str::to_string),
            refresh_token: refresh_token.map(str::to_string),
            token_uri: GOOGLE_TOKEN_URI.to_string(),
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            scopes: vec!["scope-a".to_string(), "scope-b".to_string()],
            expiry: Some(Utc::now() + Duration::hours(1)),
        }
    }

    fn expired(mut credential: Credential) -> Credential {
        credential.expiry = Some(Utc::now() - Duration::minutes(5));
        credential
    }

    #[test]
    fn test_validity() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut cred = credential(Some("token"), None);

        cred.expiry = None;
        assert!(cred.is_valid_at(now));

        cred.expiry = Some(now + Duration::hours(1));
        assert!(cred.is_valid_at(now));

        // Inside the refresh threshold counts as expired.
        cred.expiry = Some(now + Duration::minutes(3));
        assert!(!cred.is_valid_at(now));

        cred.expiry = Some(now - Duration::seconds(1));
        assert!(!cred.is_valid_at(now));

        cred.expiry = None;
        cred.access_token = None;
        assert!(!cred.is_valid_at(now));
    }

    #[test]
    fn test_record_field_names() {
        let mut cred = credential(Some("access"), Some("refresh"));
        cred.expiry = Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());
        let value: serde_json::Value = serde_json::from_str(&cred.to_json().unwrap()).unwrap();
        assert_eq!(value["token"], "access");
        assert_eq!(value["refresh_token"], "refresh");
        assert_eq!(value["token_uri"], GOOGLE_TOKEN_URI);
        assert_eq!(value["client_id"], "client-id");
        assert_eq!(value["client_secret"], "client-secret");
        assert_eq!(value["scopes"], serde_json::json!(["scope-a", "scope-b"]));
        assert_eq!(value["expiry"], "2024-05-01T08:30:00Z");
    }

    #[test]
    fn test_parse_authorized_user_record() {
        let json = r#"{
            "token": "ya29.a0",
            "refresh_token": "1//0g",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "id.apps.googleusercontent.com",
            "client_secret": "secret",
            "scopes": "https://www.googleapis.com/auth/gmail.send https://www.googleapis.com/auth/gmail.readonly",
            "universe_domain": "googleapis.com",
            "account": "",
            "expiry": "2024-03-01T10:20:30.123456"
        }"#;
        let cred = Credential::from_json(json).unwrap();
        assert_eq!(cred.access_token.as_deref(), Some("ya29.a0"));
        assert_eq!(cred.scopes.len(), 2);
        assert_eq!(
            cred.expiry.unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 30).unwrap()
                + Duration::microseconds(123_456)
        );
    }

    #[test]
    fn test_extreme_expiry_does_not_panic() {
        let mut cred = credential(Some("access"), Some("refresh"));
        cred.expiry = Some(DateTime::<Utc>::MIN_UTC);
        assert!(cred.is_expired_at(Utc::now()));
        assert!(!cred.is_valid());

        cred.expiry = Some(DateTime::<Utc>::MAX_UTC);
        assert!(cred.is_valid());

        let json = r#"{"token": "t", "client_id": "id", "client_secret": "s",
                       "expiry": "-262144-01-01T00:00:00"}"#;
        if let Ok(parsed) = Credential::from_json(json) {
            assert!(!parsed.is_valid());
        }
    }

    #[test]
    fn test_parse_minimal_record() {
        let json = r#"{"client_id": "id", "client_secret": "secret", "refresh_token": null}"#;
        let cred = Credential::from_json(json).unwrap();
        assert_eq!(cred.access_token, None);
        assert_eq!(cred.refresh_token, None);
        assert_eq!(cred.token_uri, GOOGLE_TOKEN_URI);
        assert!(cred.scopes.is_empty());
        assert_eq!(cred.expiry, None);
        assert!(!cred.is_valid());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = credential(Some("super-secret-access"), Some("super-secret-refresh"));
        let printed = format!("{cred:?}");
        assert!(!printed.contains("super-secret"));
        assert!(!printed.contains("client-secret"));
        assert!(printed.contains("client-id"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let err = load(&path, &[]).await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(p) if p == path));
    }

    #[tokio::test]
    async fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        for contents in ["", "not json", "{}", r#"{"client_id": "id"}"#, "[1, 2]"] {
            std::fs::write(&path, contents).unwrap();
            let err = load(&path, &[]).await.unwrap_err();
            assert!(
                matches!(err, CredentialError::Invalid { .. }),
                "{contents:?} gave {err:?}"
            );
            assert!(err.is_recoverable());
        }
    }

    #[tokio::test]
    async fn test_load_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, CredentialError::Io { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_load_scopes_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let cred = credential(Some("access"), Some("refresh"));
        save(&cred, &path).await.unwrap();

        let kept = load(&path, &[]).await.unwrap();
        assert_eq!(kept.scopes, cred.scopes);

        let requested = vec!["scope-c".to_string()];
        let replaced = load(&path, &requested).await.unwrap();
        assert_eq!(replaced.scopes, requested);
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("credentials.json");
        let cred = credential(Some("access"), Some("refresh"));

        save(&cred, &path).await.unwrap();
        let first = std::fs::read(&path).unwrap();
        assert_eq!(load(&path, &cred.scopes).await.unwrap(), cred);

        save(&cred, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
        assert_eq!(load(&path, &cred.scopes).await.unwrap(), cred);

        // No temporary file is left behind.
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("credentials.json")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_save_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        // A leftover world-readable temp file from an interrupted save.
        let stale = dir.path().join(".credentials.json.tmp");
        std::fs::write(&stale, "stale").unwrap();
        std::fs::set_permissions(&stale, std::fs::Permissions::from_mode(0o644)).unwrap();

        save(&credential(Some("access"), None), &path).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!stale.exists());
        assert_eq!(load(&path, &[]).await.unwrap().access_token.as_deref(), Some("access"));
    }

    #[tokio::test]
    async fn test_save_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let err = save(&credential(Some("a"), None), &blocker.join("credentials.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Io { .. }));
    }

    #[tokio::test]
    async fn test_valid_credential_is_not_refreshed() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(0);

        let cred = credential(Some("access"), Some("refresh"));
        let result = validate_or_refresh(cred.clone(), &refresher).await.unwrap();
        assert_eq!(result, cred);
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed_once() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(1).returning(|c| {
            let mut refreshed = c.clone();
            refreshed.access_token = Some("new".to_string());
            refreshed.expiry = Some(Utc::now() + Duration::hours(1));
            Ok(refreshed)
        });

        let cred = expired(credential(Some("old"), Some("r1")));
        let result = validate_or_refresh(cred, &refresher).await.unwrap();
        assert_eq!(result.access_token.as_deref(), Some("new"));
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn test_expired_credential_without_refresh_token() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(0);

        for refresh_token in [None, Some("")] {
            let cred = expired(credential(Some("old"), refresh_token));
            let err = validate_or_refresh(cred, &refresher).await.unwrap_err();
            assert!(matches!(err, CredentialError::Unrefreshable));
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_propagates() {
        let mut refresher = MockTokenRefresher::new();
        refresher
            .expect_refresh()
            .times(1)
            .returning(|_| Err(CredentialError::RefreshFailed("invalid_grant".to_string())));

        let cred = expired(credential(Some("old"), Some("r1")));
        let err = validate_or_refresh(cred, &refresher).await.unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed(reason) if reason == "invalid_grant"));
    }
}
