//! Peer aliases
//!
//! Every local replica that has been paired gets a Service named
//! `<pod-name>-peer` resolving to its remote counterpart, so training code
//! can reach the other side by a stable cluster-local name. IP addresses are
//! served by a selector-less Service with a hand-written Endpoints object;
//! host names become an `ExternalName` Service.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::error::api_status;
use crate::{Error, Result, FIELD_MANAGER};

/// Label marking Services managed as peer aliases
pub const ALIAS_LABEL: &str = "fedlearner.k8s.io/peer-alias";

/// Name of the port exposed by alias Services
const ALIAS_PORT_NAME: &str = "peer";

/// Target of an alias, parsed from a `host:port` address
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AliasTarget {
    /// Remote replica reachable at an IP address
    Ip {
        /// Remote IP
        ip: IpAddr,
        /// Remote port
        port: u16,
    },
    /// Remote replica reachable through a DNS name
    Host {
        /// Remote host name
        host: String,
        /// Remote port
        port: u16,
    },
}

impl AliasTarget {
    /// Parse `host:port`, `ip:port` or `[ipv6]:port`
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::validation(format!("address '{address}' has no port")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::validation(format!("address '{address}' has an invalid port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::validation(format!("address '{address}' has no host")));
        }
        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip { ip, port },
            Err(_) => Self::Host {
                host: host.to_string(),
                port,
            },
        })
    }

    fn port(&self) -> u16 {
        match self {
            Self::Ip { port, .. } | Self::Host { port, .. } => *port,
        }
    }
}

/// Manages alias Services in the operator namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AliasClient: Send + Sync {
    /// Create or update the alias `name` pointing at `address`
    async fn apply_alias(&self, name: &str, address: &str) -> Result<()>;
    /// Delete the alias `name`; deleting a missing alias succeeds
    async fn delete_alias(&self, name: &str) -> Result<()>;
    /// Names of every alias currently present
    async fn list_aliases(&self) -> Result<Vec<String>>;
}

/// Build the Service (and Endpoints, for IP targets) backing an alias
pub fn alias_objects(
    namespace: &str,
    name: &str,
    target: &AliasTarget,
) -> (Service, Option<Endpoints>) {
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(ALIAS_LABEL.to_string(), "true".to_string())])),
        ..Default::default()
    };
    let port = i32::from(target.port());
    let service_port = ServicePort {
        name: Some(ALIAS_PORT_NAME.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    match target {
        AliasTarget::Ip { ip, .. } => {
            let service = Service {
                metadata: metadata.clone(),
                spec: Some(ServiceSpec {
                    ports: Some(vec![service_port]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let endpoints = Endpoints {
                metadata,
                subsets: Some(vec![EndpointSubset {
                    addresses: Some(vec![EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    }]),
                    ports: Some(vec![EndpointPort {
                        name: Some(ALIAS_PORT_NAME.to_string()),
                        port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
            };
            (service, Some(endpoints))
        }
        AliasTarget::Host { host, .. } => {
            let service = Service {
                metadata,
                spec: Some(ServiceSpec {
                    type_: Some("ExternalName".to_string()),
                    external_name: Some(host.clone()),
                    ports: Some(vec![service_port]),
                    ..Default::default()
                }),
                ..Default::default()
            };
            (service, None)
        }
    }
}

/// [`AliasClient`] backed by the Kubernetes API
pub struct KubeAliasClient {
    services: Api<Service>,
    endpoints: Api<Endpoints>,
    namespace: String,
}

impl KubeAliasClient {
    /// Manage aliases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            endpoints: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    async fn apply_service(&self, name: &str, service: &Service) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        match self
            .services
            .patch(name, &params, &Patch::Apply(service))
            .await
        {
            Ok(_) => Ok(()),
            // switching between ClusterIP and ExternalName is rejected in place
            Err(e) if api_status(&e) == Some(422) => {
                debug!(alias = %name, "alias type changed, recreating service");
                self.delete_alias(name).await?;
                self.services
                    .patch(name, &params, &Patch::Apply(service))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AliasClient for KubeAliasClient {
    async fn apply_alias(&self, name: &str, address: &str) -> Result<()> {
        let target = AliasTarget::parse(address)?;
        let (service, endpoints) = alias_objects(&self.namespace, name, &target);
        self.apply_service(name, &service).await?;

        match endpoints {
            Some(endpoints) => {
                let params = PatchParams::apply(FIELD_MANAGER).force();
                self.endpoints
                    .patch(name, &params, &Patch::Apply(&endpoints))
                    .await?;
            }
            None => ignore_not_found(self.endpoints.delete(name, &DeleteParams::default()).await)?,
        }
        debug!(alias = %name, %address, "peer alias applied");
        Ok(())
    }

    async fn delete_alias(&self, name: &str) -> Result<()> {
        ignore_not_found(self.services.delete(name, &DeleteParams::default()).await)?;
        ignore_not_found(self.endpoints.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<String>> {
        let params = ListParams::default().labels(&format!("{ALIAS_LABEL}=true"));
        Ok(self
            .services
            .list(&params)
            .await?
            .items
            .iter()
            .map(|s| s.name_any())
            .collect())
    }
}

fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if api_status(&e) == Some(404) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.1.2.3:5000", AliasTarget::Ip { ip: "10.1.2.3".parse().unwrap(), port: 5000 })]
    #[case("[fd00::1]:5000", AliasTarget::Ip { ip: "fd00::1".parse().unwrap(), port: 5000 })]
    #[case("worker-0.peer.example.com:443", AliasTarget::Host { host: "worker-0.peer.example.com".into(), port: 443 })]
    fn targets_are_parsed(#[case] address: &str, #[case] expected: AliasTarget) {
        assert_eq!(AliasTarget::parse(address).unwrap(), expected);
    }

    #[rstest]
    #[case("10.1.2.3")]
    #[case("10.1.2.3:http")]
    #[case(":5000")]
    #[case("host:70000")]
    fn malformed_addresses_are_rejected(#[case] address: &str) {
        assert!(AliasTarget::parse(address).is_err());
    }

    #[test]
    fn ip_alias_is_a_selectorless_service_with_endpoints() {
        let target = AliasTarget::parse("10.1.2.3:5000").unwrap();
        let (service, endpoints) = alias_objects("default", "mnist-worker-0-peer", &target);

        let spec = service.spec.unwrap();
        assert!(spec.selector.is_none());
        assert_eq!(spec.ports.unwrap()[0].port, 5000);
        assert_eq!(
            service.metadata.labels.unwrap().get(ALIAS_LABEL).map(String::as_str),
            Some("true")
        );

        let subset = &endpoints.unwrap().subsets.unwrap()[0];
        assert_eq!(subset.addresses.as_ref().unwrap()[0].ip, "10.1.2.3");
        assert_eq!(subset.ports.as_ref().unwrap()[0].port, 5000);
    }

    #[test]
    fn host_alias_is_an_external_name_service() {
        let target = AliasTarget::parse("peer.example.com:443").unwrap();
        let (service, endpoints) = alias_objects("default", "mnist-ps-0-peer", &target);

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name.as_deref(), Some("peer.example.com"));
        assert!(endpoints.is_none());
    }
}
