//! DigitalOcean compute provider.

use std::time::Duration;

use common::config;
use derive_more::{Display, Error, From};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Timeout of a single provider API request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Count of sizes requested per page; the whole catalog fits in one.
const SIZES_PER_PAGE: u32 = 200;

/// Compute provider errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ComputeError {
    /// HTTP client error.
    Http(reqwest::Error),
}

/// Observed instance status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InstanceStatus {
    /// Instance is being created.
    Creating,

    /// Instance is running.
    Active,

    /// Instance failed to start.
    Error,

    /// Any other status reported by the provider.
    Unknown,
}

impl InstanceStatus {
    /// Map a DigitalOcean droplet status.
    fn from_provider(status: &str) -> Self {
        match status {
            "new" => Self::Creating,
            "active" => Self::Active,
            "errored" | "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Compute instance snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Instance {
    /// Provider-specific instance identifier.
    pub id: u64,

    /// Instance status.
    pub status: InstanceStatus,

    /// Public IPv4 address, once assigned.
    pub public_address: Option<String>,
}

/// Instance creation request.
#[derive(Serialize)]
pub(crate) struct InstanceRequest<'a> {
    /// Instance name.
    pub name: &'a str,

    /// Region slug.
    pub region: &'a str,

    /// Size slug.
    pub size: &'a str,

    /// Image slug.
    pub image: &'a str,

    /// Fingerprints of SSH keys to install.
    pub ssh_keys: Vec<&'a str>,
}

/// Compute instance provider.
pub(crate) trait ComputeProvider {
    /// Register a public SSH key, returning its fingerprint.
    fn register_key(&self, name: &str, public_key: &str) -> Result<String, ComputeError>;

    /// Request a new instance, returning its identifier.
    fn create_instance(&self, request: &InstanceRequest<'_>) -> Result<u64, ComputeError>;

    /// Get the current instance snapshot.
    fn instance(&self, id: u64) -> Result<Instance, ComputeError>;

    /// List slugs of sizes available for new instances.
    fn sizes(&self) -> Result<Vec<String>, ComputeError>;
}

/// SSH key registration request.
#[derive(Serialize)]
struct KeyCreateRequest<'a> {
    /// Key name.
    name: &'a str,
    /// Public key in OpenSSH format.
    public_key: &'a str,
}

/// SSH key registration response.
#[derive(Deserialize)]
struct KeyResponse {
    /// Registered key.
    ssh_key: Key,
}

/// Registered SSH key.
#[derive(Deserialize)]
struct Key {
    /// Key fingerprint.
    fingerprint: String,
}

/// Single droplet response.
#[derive(Deserialize)]
struct DropletResponse {
    /// Droplet details.
    droplet: Droplet,
}

/// Droplet details.
#[derive(Deserialize)]
struct Droplet {
    /// Droplet identifier.
    id: u64,
    /// Provider status of the droplet.
    status: String,
    /// Attached networks.
    #[serde(default)]
    networks: Networks,
}

/// Droplet networks.
#[derive(Default, Deserialize)]
struct Networks {
    /// IPv4 networks.
    #[serde(default)]
    v4: Vec<Network>,
}

/// Single droplet network.
#[derive(Deserialize)]
struct Network {
    /// Network address.
    ip_address: String,
    /// Either `public` or `private`.
    #[serde(rename = "type")]
    kind: String,
}

/// Droplet sizes response.
#[derive(Deserialize)]
struct SizesResponse {
    /// Known sizes.
    sizes: Vec<Size>,
}

/// Droplet size.
#[derive(Deserialize)]
struct Size {
    /// Size slug.
    slug: String,
    /// Whether the size can be used for new droplets.
    #[serde(default)]
    available: bool,
}

impl From<Droplet> for Instance {
    fn from(droplet: Droplet) -> Self {
        let public_address = droplet
            .networks
            .v4
            .into_iter()
            .find(|network| network.kind == "public")
            .map(|network| network.ip_address);

        Instance {
            id: droplet.id,
            status: InstanceStatus::from_provider(&droplet.status),
            public_address,
        }
    }
}

/// DigitalOcean API v2 client.
pub(crate) struct DigitalOcean {
    /// HTTP client.
    client: Client,
    /// API base URL without a trailing slash.
    api_url: String,
    /// Personal access token.
    access_token: String,
}

impl DigitalOcean {
    /// Create a client from the compute settings.
    pub fn new(config: &config::Compute) -> Result<Self, ComputeError> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            access_token: config.access_token.clone(),
        })
    }
}

impl ComputeProvider for DigitalOcean {
    fn register_key(&self, name: &str, public_key: &str) -> Result<String, ComputeError> {
        debug!(name, "registering ssh key");

        let response: KeyResponse = self
            .client
            .post(format!("{}/account/keys", self.api_url))
            .bearer_auth(&self.access_token)
            .json(&KeyCreateRequest { name, public_key })
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.ssh_key.fingerprint)
    }

    fn create_instance(&self, request: &InstanceRequest<'_>) -> Result<u64, ComputeError> {
        debug!(name = request.name, size = request.size, "creating droplet");

        let response: DropletResponse = self
            .client
            .post(format!("{}/droplets", self.api_url))
            .bearer_auth(&self.access_token)
            .json(request)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.droplet.id)
    }

    fn instance(&self, id: u64) -> Result<Instance, ComputeError> {
        let response: DropletResponse = self
            .client
            .get(format!("{}/droplets/{id}", self.api_url))
            .bearer_auth(&self.access_token)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(response.droplet.into())
    }

    fn sizes(&self) -> Result<Vec<String>, ComputeError> {
        let response: SizesResponse = self
            .client
            .get(format!("{}/sizes", self.api_url))
            .query(&[("per_page", SIZES_PER_PAGE)])
            .bearer_auth(&self.access_token)
            .send()?
            .error_for_status()?
            .json()?;

        Ok(available_slugs(response.sizes))
    }
}

/// Slugs of sizes that are currently available.
fn available_slugs(sizes: Vec<Size>) -> Vec<String> {
    sizes
        .into_iter()
        .filter(|size| size.available)
        .map(|size| size.slug)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{available_slugs, DropletResponse, Instance, InstanceStatus, SizesResponse};

    #[test]
    fn droplet_exposes_public_address() {
        let response: DropletResponse = serde_json::from_str(
            r#"{
                "droplet": {
                    "id": 3164444,
                    "name": "blog",
                    "status": "active",
                    "networks": {
                        "v4": [
                            {"ip_address": "10.128.192.124", "type": "private"},
                            {"ip_address": "192.241.165.154", "type": "public"}
                        ]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(
            Instance::from(response.droplet),
            Instance {
                id: 3164444,
                status: InstanceStatus::Active,
                public_address: Some(String::from("192.241.165.154")),
            }
        );
    }

    #[test]
    fn new_droplet_has_no_address() {
        let response: DropletResponse = serde_json::from_str(
            r#"{"droplet": {"id": 1, "status": "new", "networks": {"v4": []}}}"#,
        )
        .unwrap();

        let instance = Instance::from(response.droplet);

        assert_eq!(instance.status, InstanceStatus::Creating);
        assert!(instance.public_address.is_none());
    }

    #[test]
    fn statuses_are_mapped() {
        assert_eq!(InstanceStatus::from_provider("new"), InstanceStatus::Creating);
        assert_eq!(InstanceStatus::from_provider("active"), InstanceStatus::Active);
        assert_eq!(InstanceStatus::from_provider("errored"), InstanceStatus::Error);
        assert_eq!(InstanceStatus::from_provider("off"), InstanceStatus::Unknown);
    }

    #[test]
    fn unavailable_sizes_are_skipped() {
        let response: SizesResponse = serde_json::from_str(
            r#"{"sizes": [
                {"slug": "s-1vcpu-1gb", "available": true},
                {"slug": "s-8vcpu-16gb", "available": false}
            ]}"#,
        )
        .unwrap();

        assert_eq!(available_slugs(response.sizes), vec!["s-1vcpu-1gb"]);
    }
}
