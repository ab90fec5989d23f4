use std::str::FromStr;

const HOST_OPT: &str = "host";
const AUTHORITY_OPT: &str = "authority";
const METADATA_OPT: &str = "metadata";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("target cannot be empty")]
    Empty,
    #[error("target '{0}' does not name a host")]
    MissingHost(String),
}

/// A target string split into the address to dial and its inline options.
///
/// Targets are comma separated tokens. `key=value` tokens set an option (`host`, `authority`
/// or a repeatable `metadata=key:value`), unknown keys are ignored and a bare token is the
/// host itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    pub host: String,
    pub authority: Option<String>,
    pub metadata: Vec<(String, String)>,
}

impl FromStr for ConnectionOptions {
    type Err = TargetError;

    fn from_str(target: &str) -> Result<Self, Self::Err> {
        if target.trim().is_empty() {
            return Err(TargetError::Empty);
        }

        let mut opts = Self::default();

        for token in target.split(',').map(str::trim) {
            match token.split_once('=') {
                Some((key, value)) => {
                    let value = value.trim();
                    match key.trim() {
                        HOST_OPT => opts.host = value.to_string(),
                        AUTHORITY_OPT => opts.authority = Some(value.to_string()),
                        METADATA_OPT => {
                            let (k, v) = value.split_once(':').unwrap_or((value, ""));
                            opts.metadata.push((k.to_string(), v.to_string()));
                        }
                        _ => {}
                    }
                }
                None => opts.host = token.to_string(),
            }
        }

        if opts.host.is_empty() {
            return Err(TargetError::MissingHost(target.to_string()));
        }

        Ok(opts)
    }
}
