use super::protos::ProtoSourceError;
use super::reflection::ReflectionResolveError;
use super::registry::{RegistryError, TypeRegistry};
use crate::rpc::ConnectionError;
use prost_reflect::{FileDescriptor, MethodDescriptor, ServiceDescriptor};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("Reflection failed: {0}")]
    Reflection(#[from] ReflectionResolveError),

    #[error("Error parsing proto files: {0}")]
    Protos(#[from] ProtoSourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Service '{0}' was not found in the acquired descriptors")]
    ServiceNotFound(String),

    #[error("Descriptor acquisition timed out")]
    Timeout,
}

/// A service together with its methods and the file declaring it.
#[derive(Debug, Clone)]
pub struct ServiceMeta {
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
    pub file: FileDescriptor,
}

impl ServiceMeta {
    pub fn new(service: &ServiceDescriptor) -> Self {
        Self {
            name: service.full_name().to_string(),
            methods: service.methods().collect(),
            file: service.parent_file(),
        }
    }

    /// Finds a method by name, ignoring case.
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }
}

/// Every service available in a session, backed by the registry they were resolved from.
#[derive(Debug, Clone)]
pub struct ServiceMetaList {
    services: Vec<ServiceMeta>,
    registry: Arc<TypeRegistry>,
}

impl ServiceMetaList {
    /// Resolves each name in `service_names` against the registry pool.
    pub fn new<I, N>(registry: Arc<TypeRegistry>, service_names: I) -> Result<Self, AcquireError>
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let services = service_names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                registry
                    .pool()
                    .get_service_by_name(name)
                    .map(|svc| ServiceMeta::new(&svc))
                    .ok_or_else(|| AcquireError::ServiceNotFound(name.to_string()))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { services, registry })
    }

    /// Builds the list from every service declared by `files`, in declaration order.
    pub fn from_files(registry: Arc<TypeRegistry>, files: &[String]) -> Self {
        let services = files
            .iter()
            .filter_map(|name| registry.pool().get_file_by_name(name))
            .flat_map(|file| file.services().collect::<Vec<_>>())
            .map(|svc| ServiceMeta::new(&svc))
            .collect();

        Self { services, registry }
    }

    pub fn services(&self) -> &[ServiceMeta] {
        &self.services
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// The distinct files owning the listed services.
    pub fn files(&self) -> Vec<FileDescriptor> {
        let mut files: Vec<FileDescriptor> = Vec::new();
        for svc in &self.services {
            if !files.iter().any(|f| f.name() == svc.file.name()) {
                files.push(svc.file.clone());
            }
        }
        files
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

/// A strategy producing the service list of a session.
pub trait ServiceMetaProvider {
    fn service_meta_list(
        &mut self,
    ) -> impl Future<Output = Result<ServiceMetaList, AcquireError>> + Send;
}
