use ai::{
    blip::{BLIPModel, BLIPOptions, ModelFormat},
    generation::GenerationParams,
    hub::ArtifactSource,
};
use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

const DEFAULT_MODEL_REPO: &str = "Salesforce/blip-image-captioning-large";
// the main branch of the large model only ships pytorch weights
const DEFAULT_MODEL_REVISION: &str = "refs/pr/18";
const DEFAULT_MODEL_FILE: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";
const DEFAULT_BODY_LIMIT: usize = 20 * 1024 * 1024;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub repo_id: String,
    pub revision: String,
    pub model_file: String,
    pub tokenizer_repo_id: String,
    pub tokenizer_revision: String,
    pub model_path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    pub format: ModelFormat,
    pub model_type: BLIPModel,
    pub num_beams: usize,
    pub max_length: usize,
    pub cpu: bool,
    /// `None` keeps the model resident for the lifetime of the server.
    pub offload_duration: Option<Duration>,
}

impl ModelConfig {
    pub fn model_id(&self) -> String {
        match &self.model_path {
            Some(path) => format!("blip-{}", path.display()),
            None => format!("blip-{}", self.repo_id),
        }
    }

    pub fn blip_options(&self) -> BLIPOptions {
        let model = match &self.model_path {
            Some(path) => ArtifactSource::Local(path.clone()),
            None => ArtifactSource::Hub {
                repo_id: self.repo_id.clone(),
                revision: self.revision.clone(),
                filename: self.model_file.clone(),
            },
        };
        let tokenizer = match &self.tokenizer_path {
            Some(path) => ArtifactSource::Local(path.clone()),
            None => ArtifactSource::Hub {
                repo_id: self.tokenizer_repo_id.clone(),
                revision: self.tokenizer_revision.clone(),
                filename: TOKENIZER_FILE.into(),
            },
        };

        BLIPOptions {
            model,
            tokenizer,
            model_type: self.model_type,
            format: self.format,
            generation: GenerationParams {
                num_beams: self.num_beams,
                max_length: self.max_length,
                ..Default::default()
            },
            cpu: self.cpu,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub body_limit: usize,
    pub log_dir: Option<PathBuf>,
    pub model: ModelConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let repo_id = get("CAPTION_MODEL_REPO").unwrap_or_else(|| DEFAULT_MODEL_REPO.into());
        let revision =
            get("CAPTION_MODEL_REVISION").unwrap_or_else(|| DEFAULT_MODEL_REVISION.into());

        let num_beams: usize = parse(&get, "CAPTION_NUM_BEAMS", 5)?;
        if num_beams == 0 {
            return Err(invalid("CAPTION_NUM_BEAMS", "0", "must be at least 1"));
        }
        let max_length: usize = parse(&get, "CAPTION_MAX_LENGTH", 64)?;
        if max_length < 2 {
            return Err(invalid(
                "CAPTION_MAX_LENGTH",
                &max_length.to_string(),
                "must be at least 2",
            ));
        }

        let offload_duration = match get("CAPTION_OFFLOAD_SECS") {
            Some(value) => {
                let secs: u64 = value
                    .trim()
                    .parse()
                    .map_err(|e: std::num::ParseIntError| invalid("CAPTION_OFFLOAD_SECS", &value, e))?;
                if secs == 0 {
                    return Err(invalid("CAPTION_OFFLOAD_SECS", &value, "must be at least 1"));
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        let model = ModelConfig {
            tokenizer_repo_id: get("CAPTION_TOKENIZER_REPO").unwrap_or_else(|| repo_id.clone()),
            tokenizer_revision: get("CAPTION_TOKENIZER_REVISION")
                .unwrap_or_else(|| revision.clone()),
            repo_id,
            revision,
            model_file: get("CAPTION_MODEL_FILE").unwrap_or_else(|| DEFAULT_MODEL_FILE.into()),
            model_path: get("CAPTION_MODEL_PATH").map(PathBuf::from),
            tokenizer_path: get("CAPTION_TOKENIZER_PATH").map(PathBuf::from),
            format: parse(&get, "CAPTION_MODEL_FORMAT", ModelFormat::default())?,
            model_type: parse(&get, "CAPTION_MODEL_TYPE", BLIPModel::default())?,
            num_beams,
            max_length,
            cpu: parse_bool(&get, "CAPTION_CPU")?,
            offload_duration,
        };

        Ok(Self {
            host: parse(&get, "CAPTION_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?,
            port: parse(&get, "CAPTION_PORT", 8000)?,
            body_limit: parse(&get, "CAPTION_BODY_LIMIT_BYTES", DEFAULT_BODY_LIMIT)?,
            log_dir: get("CAPTION_LOG_DIR").map(PathBuf::from),
            model,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &value, e)),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &v, "expected a boolean")),
        },
    }
}
