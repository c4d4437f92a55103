//! Sharded Request Routing
//!
//! The sharding ring decides which cluster answers each request:
//!
//! ```text
//!           +-------------+
//! Accept -->|   Routed    |-- DELETE / bucket op --> All clusters --> Respond
//!           +------+------+
//!                  | key op
//!                  v
//!           +-------------+   ok            +----------+
//!           |   Primary   |---------------->| Respond  |
//!           |   cluster   |                 +----------+
//!           +------+------+
//!                  | error / status > 400
//!                  v
//!           +-------------+
//!           | Regression  |-- predecessor --> (loop)
//!           +------+------+
//!                  | no predecessor
//!                  v
//!             Respond (last)
//! ```
//!
//! Object keys are placed on a consistent-hash ring of weighted shards;
//! bucket-scoped operations and DELETEs touch every backend of every
//! cluster. When a cluster fails, the request regresses to the preceding
//! cluster of the client's ordered list, one hop per failure, which favours
//! read availability over write consistency.

pub mod hashring;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::config::{ClientConfig, Config, ConfigError, CLUSTER_TYPE_REPLICATOR};
use crate::synclog::{SyncRecord, SyncReporter};
use crate::transport::{
    FirstSuccessPicker, MultiTransport, PickResponse, ProxyRequest, ProxyResponse, RoundTrip,
    SharedTransport, TransportError,
};

pub use hashring::HashRing;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building the ring; all fatal at startup.
#[derive(Debug, Error)]
pub enum RingError {
    /// Client references a cluster with no configuration block.
    #[error("no cluster {name:?} in configuration")]
    UnknownCluster {
        /// The missing cluster name.
        name: String,
    },

    /// Every backend of the cluster is under maintenance.
    #[error("cluster {name:?} has no routable backends")]
    NoRoutableBackends {
        /// The affected cluster name.
        name: String,
    },

    /// The cluster type names no known response-selection policy.
    #[error("unsupported cluster type {kind:?} for cluster {name:?}")]
    UnsupportedClusterType {
        /// The unrecognised type.
        kind: String,
        /// The affected cluster name.
        name: String,
    },

    /// The configuration carries no client section.
    #[error("no client section in configuration")]
    MissingClient,

    /// The client lists no clusters.
    #[error("client cluster list is empty")]
    NoClusters,

    /// Invalid configuration detail discovered during construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Cluster
// ============================================================================

/// A named, weighted backend set behind one fan-out transport.
pub struct Cluster {
    name: String,
    weight: u32,
    backends: Vec<Url>,
    transport: MultiTransport,
}

impl Cluster {
    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shard weight.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Routable (non-maintained) backends.
    #[must_use]
    pub fn backends(&self) -> &[Url] {
        &self.backends
    }
}

#[async_trait]
impl RoundTrip for Cluster {
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        self.transport.round_trip(request).await
    }
}

// ============================================================================
// Shards ring
// ============================================================================

/// True when `path` addresses a bucket itself rather than an object in it:
/// trimmed of leading and trailing `/` it holds a single segment.
#[must_use]
pub fn is_bucket_path(path: &str) -> bool {
    !path.trim_matches('/').contains('/')
}

/// Where [`ShardsRing::pick`] routed a key.
pub enum RingTarget<'a> {
    /// Bucket-scoped: the union of every cluster's backends.
    AllClusters,
    /// Key-scoped: one cluster, selected by consistent hash.
    Cluster(&'a Arc<Cluster>),
}

/// The immutable routing table of one client: consistent-hash ring,
/// shard ownership, all-clusters transport and regression chain.
pub struct ShardsRing {
    ring: HashRing,
    shard_cluster_map: HashMap<String, Arc<Cluster>>,
    all_clusters: MultiTransport,
    regression_map: HashMap<String, Arc<Cluster>>,
    sync_methods: HashSet<Method>,
    reporter: SyncReporter,
}

impl std::fmt::Debug for ShardsRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardsRing").finish_non_exhaustive()
    }
}

impl ShardsRing {
    /// Route `key` (a URL path) to its target transport.
    pub fn pick(&self, key: &str) -> Result<RingTarget<'_>, TransportError> {
        if is_bucket_path(key) {
            return Ok(RingTarget::AllClusters);
        }
        let shard = self
            .ring
            .locate(key)
            .ok_or_else(|| TransportError::Routing("ring holds no shards".to_string()))?;
        let cluster = self.shard_cluster_map.get(shard).ok_or_else(|| {
            TransportError::Routing(format!(
                "no cluster for shard {shard}, cannot handle key {key}"
            ))
        })?;
        Ok(RingTarget::Cluster(cluster))
    }

    /// Number of shards placed on the ring.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.ring.len()
    }

    /// Dispatch to one cluster and walk the regression chain on failure.
    ///
    /// Failed hops are captured along the way and their sync records are
    /// emitted only once the chain settles, so every record names the
    /// destination the client actually got.
    async fn regression_call(
        &self,
        mut cluster: Arc<Cluster>,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, TransportError> {
        let template = request.retry_template();
        let mut failed_hops = Vec::new();
        let mut outcome = cluster.round_trip(request).await;

        while needs_regression(&outcome) {
            let Some(previous) = self.regression_map.get(cluster.name()) else {
                break;
            };
            failed_hops.push(FailedHop::capture(&cluster, &outcome));
            warn!(
                from = cluster.name(),
                to = previous.name(),
                path = %template.path,
                "cluster failed, regressing to predecessor"
            );
            // The streaming body is gone after the first dispatch; the
            // retry goes out body-less.
            let retry = template.retry_template();
            cluster = Arc::clone(previous);
            outcome = cluster.round_trip(retry).await;
        }

        self.report_regressions(&template, failed_hops, &outcome);
        outcome
    }

    /// One sync record per failed hop, each completed with the chain's
    /// final destination.
    fn report_regressions(
        &self,
        template: &ProxyRequest,
        hops: Vec<FailedHop>,
        outcome: &Result<ProxyResponse, TransportError>,
    ) {
        if hops.is_empty() || !self.sync_methods.contains(&template.method) {
            return;
        }
        let chosen_backend = match outcome {
            Ok(response) => response
                .backend
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
            Err(e) => e.to_string(),
        };
        for hop in hops {
            let mut record =
                SyncRecord::new(template.method.as_str(), template.path.clone(), hop.cluster);
            if let Some(backend) = hop.backend {
                record.backend = backend.to_string();
            }
            record.status = hop.status;
            record.error = hop.error;
            record.chosen_backend = chosen_backend.clone();
            self.reporter.report(record);
        }
    }
}

/// Snapshot of one failed regression hop, taken before the chain moves on.
struct FailedHop {
    cluster: String,
    backend: Option<Url>,
    status: Option<u16>,
    error: Option<String>,
}

impl FailedHop {
    fn capture(cluster: &Cluster, outcome: &Result<ProxyResponse, TransportError>) -> Self {
        match outcome {
            Ok(response) => Self {
                cluster: cluster.name().to_string(),
                backend: response.backend.clone(),
                status: Some(response.status.as_u16()),
                error: None,
            },
            Err(e) => Self {
                cluster: cluster.name().to_string(),
                backend: None,
                status: None,
                error: Some(e.to_string()),
            },
        }
    }
}

fn needs_regression(outcome: &Result<ProxyResponse, TransportError>) -> bool {
    match outcome {
        Ok(response) => response.status.as_u16() > 400,
        Err(_) => true,
    }
}

#[async_trait]
impl RoundTrip for ShardsRing {
    async fn round_trip(&self, request: ProxyRequest) -> Result<ProxyResponse, TransportError> {
        if request.method == Method::DELETE {
            return self.all_clusters.round_trip(request).await;
        }
        match self.pick(&request.path)? {
            RingTarget::AllClusters => self.all_clusters.round_trip(request).await,
            RingTarget::Cluster(cluster) => {
                let cluster = Arc::clone(cluster);
                self.regression_call(cluster, request).await
            }
        }
    }
}

// ============================================================================
// Ring factory
// ============================================================================

/// Builds the ring from configuration, caching clusters by name.
pub struct RingFactory {
    config: Config,
    shared: Arc<SharedTransport>,
    reporter: SyncReporter,
    clusters: HashMap<String, Arc<Cluster>>,
}

impl RingFactory {
    /// Create a factory over validated configuration.
    #[must_use]
    pub fn new(config: Config, shared: Arc<SharedTransport>, reporter: SyncReporter) -> Self {
        Self {
            config,
            shared,
            reporter,
            clusters: HashMap::new(),
        }
    }

    /// Build the ring for the configured client.
    pub fn client_ring(mut self) -> Result<ShardsRing, RingError> {
        let client = self.config.client.clone().ok_or(RingError::MissingClient)?;
        if client.clusters.is_empty() {
            return Err(RingError::NoClusters);
        }

        let mut weight_sum = 0u64;
        let mut regression_map = HashMap::new();
        let mut previous: Option<Arc<Cluster>> = None;
        for name in &client.clusters {
            let cluster = self.cluster(name)?;
            weight_sum += u64::from(cluster.weight());
            if let Some(prev) = previous.replace(Arc::clone(&cluster)) {
                regression_map.insert(name.clone(), prev);
            }
        }

        let shard_cluster_map = self.map_shards(weight_sum, &client)?;
        let ring = HashRing::new(shard_cluster_map.keys().cloned());

        let all_backends = self.uniq_backends(&client)?;
        let all_picker = self.picker("all-clusters", CLUSTER_TYPE_REPLICATOR)?;
        let all_clusters = MultiTransport::new(
            "all-clusters",
            all_backends,
            all_picker,
            Arc::clone(&self.shared),
        );

        info!(
            client = %client.name,
            shards = ring.len(),
            clusters = client.clusters.len(),
            "sharding ring built"
        );

        Ok(ShardsRing {
            ring,
            shard_cluster_map,
            all_clusters,
            regression_map,
            sync_methods: self.config.sync_methods()?,
            reporter: self.reporter,
        })
    }

    /// The cluster named in configuration, built once and cached.
    fn cluster(&mut self, name: &str) -> Result<Arc<Cluster>, RingError> {
        if let Some(cluster) = self.clusters.get(name) {
            return Ok(Arc::clone(cluster));
        }
        let conf = self
            .config
            .clusters
            .get(name)
            .ok_or_else(|| RingError::UnknownCluster {
                name: name.to_string(),
            })?;

        let backends: Vec<Url> = conf
            .backends
            .iter()
            .filter(|url| Some(*url) != self.config.maintained_backend.as_ref())
            .cloned()
            .collect();
        if backends.is_empty() {
            return Err(RingError::NoRoutableBackends {
                name: name.to_string(),
            });
        }

        let picker = self.picker(name, &conf.kind)?;
        let transport = MultiTransport::new(
            name,
            backends.clone(),
            picker,
            Arc::clone(&self.shared),
        );
        let cluster = Arc::new(Cluster {
            name: name.to_string(),
            weight: conf.weight,
            backends,
            transport,
        });
        self.clusters.insert(name.to_string(), Arc::clone(&cluster));
        Ok(cluster)
    }

    fn picker(&self, label: &str, kind: &str) -> Result<Arc<dyn PickResponse>, RingError> {
        match kind {
            CLUSTER_TYPE_REPLICATOR => Ok(Arc::new(FirstSuccessPicker::new(
                label,
                self.config.sync_methods()?,
                self.reporter.clone(),
            ))),
            other => Err(RingError::UnsupportedClusterType {
                kind: other.to_string(),
                name: label.to_string(),
            }),
        }
    }

    /// Assign `floor(ShardsCount × weight / Σ weights)` shards per cluster,
    /// in client list order with a running offset.
    fn map_shards(
        &mut self,
        weight_sum: u64,
        client: &ClientConfig,
    ) -> Result<HashMap<String, Arc<Cluster>>, RingError> {
        let mut map = HashMap::with_capacity(client.shards_count as usize);
        let mut offset = 0u64;
        for name in &client.clusters {
            let cluster = self.cluster(name)?;
            let share = u64::from(client.shards_count) * u64::from(cluster.weight()) / weight_sum;
            for i in offset..offset + share {
                map.insert(format!("{}-{i}", client.name), Arc::clone(&cluster));
            }
            offset += share;
        }
        Ok(map)
    }

    /// The URL-deduplicated union of every client cluster's backends.
    fn uniq_backends(&mut self, client: &ClientConfig) -> Result<Vec<Url>, RingError> {
        let mut seen = HashSet::new();
        let mut backends = Vec::new();
        for name in &client.clusters {
            for url in self.cluster(name)?.backends() {
                if seen.insert(url.clone()) {
                    backends.push(url.clone());
                }
            }
        }
        Ok(backends)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::config::ClusterConfig;
    use crate::transport::SharedTransport;

    use super::*;

    fn cluster_conf(backends: &[&str], weight: u32) -> ClusterConfig {
        ClusterConfig {
            kind: CLUSTER_TYPE_REPLICATOR.to_string(),
            weight,
            backends: backends.iter().map(|b| Url::parse(b).unwrap()).collect(),
            options: Default::default(),
        }
    }

    fn two_cluster_config(weight1: u32, weight2: u32, shards: u32) -> Config {
        let mut config = Config::default();
        config.clusters.insert(
            "cluster1".to_string(),
            cluster_conf(&["http://a:9000", "http://b:9000"], weight1),
        );
        config.clusters.insert(
            "cluster2".to_string(),
            cluster_conf(&["http://c:9000", "http://d:9000"], weight2),
        );
        config.client = Some(ClientConfig {
            name: "client1".to_string(),
            clusters: vec!["cluster1".to_string(), "cluster2".to_string()],
            shards_count: shards,
        });
        config
    }

    fn factory(config: Config) -> RingFactory {
        let shared = SharedTransport::from_config(&config).unwrap();
        RingFactory::new(config, shared, SyncReporter::disabled())
    }

    #[test]
    fn bucket_path_detection() {
        for path in ["/foo", "/bar/", "/", "bucket"] {
            assert!(is_bucket_path(path), "{path} should be a bucket path");
        }
        for path in ["/foo/1", "/bar/1/", "/a/b/c"] {
            assert!(!is_bucket_path(path), "{path} should be an object path");
        }
    }

    #[tokio::test]
    async fn shards_follow_weights() {
        let ring = factory(two_cluster_config(2, 1, 30)).client_ring().unwrap();
        assert_eq!(ring.shard_count(), 30);

        let owned_by = |name: &str| {
            ring.shard_cluster_map
                .values()
                .filter(|c| c.name() == name)
                .count()
        };
        assert_eq!(owned_by("cluster1"), 20);
        assert_eq!(owned_by("cluster2"), 10);
    }

    #[tokio::test]
    async fn equal_weights_split_evenly() {
        let ring = factory(two_cluster_config(1, 1, 20)).client_ring().unwrap();
        let owned_by = |name: &str| {
            ring.shard_cluster_map
                .values()
                .filter(|c| c.name() == name)
                .count()
        };
        assert_eq!(owned_by("cluster1"), 10);
        assert_eq!(owned_by("cluster2"), 10);
    }

    #[tokio::test]
    async fn ring_lookup_is_stable_across_builds() {
        let first = factory(two_cluster_config(1, 1, 20)).client_ring().unwrap();
        let second = factory(two_cluster_config(1, 1, 20)).client_ring().unwrap();

        for i in 0..50 {
            let key = format!("/index/object-{i}");
            let name_in = |ring: &ShardsRing| match ring.pick(&key).unwrap() {
                RingTarget::Cluster(c) => c.name().to_string(),
                RingTarget::AllClusters => panic!("{key} routed as bucket path"),
            };
            assert_eq!(name_in(&first), name_in(&second));
        }
    }

    #[tokio::test]
    async fn bucket_keys_route_to_all_clusters() {
        let ring = factory(two_cluster_config(1, 1, 20)).client_ring().unwrap();
        assert!(matches!(
            ring.pick("/index/").unwrap(),
            RingTarget::AllClusters
        ));
        assert!(matches!(
            ring.pick("/index/a").unwrap(),
            RingTarget::Cluster(_)
        ));
    }

    #[tokio::test]
    async fn regression_map_links_adjacent_clusters() {
        let mut config = two_cluster_config(1, 1, 20);
        config.clusters.insert(
            "cluster3".to_string(),
            cluster_conf(&["http://e:9000"], 1),
        );
        config
            .client
            .as_mut()
            .unwrap()
            .clusters
            .push("cluster3".to_string());

        let ring = factory(config).client_ring().unwrap();
        assert!(ring.regression_map.get("cluster1").is_none());
        assert_eq!(ring.regression_map["cluster2"].name(), "cluster1");
        assert_eq!(ring.regression_map["cluster3"].name(), "cluster2");
    }

    #[tokio::test]
    async fn maintained_backend_is_excluded() {
        let mut config = two_cluster_config(1, 1, 20);
        config.maintained_backend = Some(Url::parse("http://a:9000").unwrap());

        let ring = factory(config).client_ring().unwrap();
        let cluster1 = ring
            .shard_cluster_map
            .values()
            .find(|c| c.name() == "cluster1")
            .unwrap();
        assert_eq!(cluster1.backends().len(), 1);
        assert_eq!(cluster1.backends()[0].as_str(), "http://b:9000/");
    }

    #[tokio::test]
    async fn all_clusters_transport_deduplicates_backends() {
        let mut config = two_cluster_config(1, 1, 20);
        // cluster2 shares one backend with cluster1.
        config.clusters.get_mut("cluster2").unwrap().backends =
            vec![
                Url::parse("http://a:9000").unwrap(),
                Url::parse("http://c:9000").unwrap(),
            ];

        let ring = factory(config).client_ring().unwrap();
        assert_eq!(ring.all_clusters.backends().len(), 3);
    }

    #[tokio::test]
    async fn unknown_cluster_reference_fails() {
        let mut config = two_cluster_config(1, 1, 20);
        config
            .client
            .as_mut()
            .unwrap()
            .clusters
            .push("missing".to_string());

        let err = factory(config).client_ring().unwrap_err();
        assert!(matches!(err, RingError::UnknownCluster { name } if name == "missing"));
    }

    #[tokio::test]
    async fn fully_maintained_cluster_fails() {
        let mut config = two_cluster_config(1, 1, 20);
        config.clusters.get_mut("cluster2").unwrap().backends =
            vec![Url::parse("http://only:9000").unwrap()];
        config.maintained_backend = Some(Url::parse("http://only:9000").unwrap());

        let err = factory(config).client_ring().unwrap_err();
        assert!(matches!(err, RingError::NoRoutableBackends { name } if name == "cluster2"));
    }
}
