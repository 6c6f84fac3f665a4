//! Registry credentials, read from the docker CLI configuration.

use std::{collections::BTreeMap, env, fs, io, path::PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Credentials for one registry, as accepted by the engine in the `X-Registry-Config` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

/// Credentials keyed by registry address.
pub type AuthConfigs = BTreeMap<String, AuthConfig>;

/// Partial implementation of `~/.docker/config.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, ConfigFileAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFileAuth {
    /// Base64 of `username:password`.
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

fn config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    home::home_dir().map(|home| home.join(".docker").join("config.json"))
}

/// Loads the credentials stored in the docker CLI configuration. A missing configuration yields no
/// credentials.
pub fn load() -> Result<AuthConfigs> {
    let Some(path) = config_path() else {
        warn!("failed to determine home directory, not using registry credentials");
        return Ok(AuthConfigs::new());
    };

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!("no docker configuration at {}", path.display());
            return Ok(AuthConfigs::new());
        }
        Err(error) => return Err(format!("failed to read {}: {error}", path.display()).into()),
    };

    parse(&contents).map_err(|error| format!("failed to parse {}: {error}", path.display()).into())
}

pub fn parse(contents: &str) -> Result<AuthConfigs> {
    let file: ConfigFile = serde_json::from_str(contents)?;

    let mut configs = AuthConfigs::new();
    for (registry, entry) in file.auths {
        let mut config = AuthConfig {
            serveraddress: Some(registry.clone()),
            identitytoken: entry.identitytoken.filter(|token| !token.is_empty()),
            ..Default::default()
        };

        if let Some(auth) = entry.auth.as_deref().filter(|auth| !auth.is_empty()) {
            let decoded = String::from_utf8(BASE64_STANDARD.decode(auth)?)?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| format!("invalid auth for registry {registry:?}"))?;
            config.username = Some(username.to_owned());
            config.password = Some(password.to_owned());
        }

        configs.insert(registry, config);
    }

    Ok(configs)
}

/// Encodes credentials for the `X-Registry-Config` header.
pub fn encode_header(configs: &AuthConfigs) -> Result<String> {
    use base64::engine::general_purpose::URL_SAFE;

    Ok(URL_SAFE.encode(serde_json::to_vec(configs)?))
}
