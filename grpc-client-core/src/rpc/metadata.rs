use std::sync::Arc;
use tonic::metadata::errors::{InvalidMetadataKey, InvalidMetadataValue};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Invalid metadata (header) key '{key}': '{source}'")]
    InvalidMetadataKey {
        key: String,
        source: InvalidMetadataKey,
    },
    #[error("Invalid metadata (header) value for key '{key}': '{source}'")]
    InvalidMetadataValue {
        key: String,
        source: InvalidMetadataValue,
    },
}

/// Appends a fixed list of metadata entries to every outgoing call, in order.
#[derive(Debug, Clone, Default)]
pub struct MetadataInjector {
    entries: Arc<Vec<(AsciiMetadataKey, AsciiMetadataValue)>>,
}

impl MetadataInjector {
    pub fn new(headers: &[(String, String)]) -> Result<Self, MetadataError> {
        let entries = headers
            .iter()
            .map(|(k, v)| {
                let key = AsciiMetadataKey::from_bytes(k.to_ascii_lowercase().as_bytes())
                    .map_err(|source| MetadataError::InvalidMetadataKey {
                        key: k.clone(),
                        source,
                    })?;
                let value = AsciiMetadataValue::try_from(v.as_str()).map_err(|source| {
                    MetadataError::InvalidMetadataValue {
                        key: k.clone(),
                        source,
                    }
                })?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, MetadataError>>()?;

        Ok(Self {
            entries: Arc::new(entries),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Interceptor for MetadataInjector {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        for (key, value) in self.entries.iter() {
            request.metadata_mut().append(key.clone(), value.clone());
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_in_order() {
        let mut injector = MetadataInjector::new(&[
            ("X-Key".to_string(), "1".to_string()),
            ("x-key".to_string(), "2".to_string()),
            ("other".to_string(), "v".to_string()),
        ])
        .unwrap();

        let request = injector.call(Request::new(())).unwrap();
        let values: Vec<_> = request
            .metadata()
            .get_all("x-key")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();

        assert_eq!(values, vec!["1", "2"]);
        let other = request.metadata().get("other").unwrap();
        assert_eq!(other.to_str().unwrap(), "v");
    }

    #[test]
    fn test_rejects_invalid_entries() {
        let err = MetadataInjector::new(&[("bad key".to_string(), "v".to_string())]).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidMetadataKey { .. }));

        let err = MetadataInjector::new(&[("key".to_string(), "bad\nvalue".to_string())])
            .unwrap_err();
        assert!(matches!(err, MetadataError::InvalidMetadataValue { .. }));
    }
}
