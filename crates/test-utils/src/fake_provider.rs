use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spotrun::errors::{Result, SpotrunError};
use spotrun::pricing::PriceMap;
use spotrun::provider::{BoxFuture, CloudProvider, InstanceRequest, ProviderError};
use spotrun::types::{Arch, CpuTopology};

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    GetSpotPrices { region: String },
    DescribeCredential { region: String, name: String },
    CreateCredential { region: String, name: String },
    DeleteCredential { region: String, name: String },
    EnsureIngressRule { region: String, group: String },
    FindImage { region: String, arch: Arch },
    RequestInstance {
        region: String,
        instance_type: String,
        cpu_topology: Option<CpuTopology>,
    },
    WaitUntilRunning { region: String, instance_id: String },
    Terminate { region: String, instance_id: String },
    WaitForManagementPort { ip: String },
}

#[derive(Default)]
struct Script {
    prices: HashMap<String, std::result::Result<PriceMap, ProviderError>>,
    request_errors: HashMap<(String, String), ProviderError>,
    credentials: HashSet<(String, String)>,
    describe_error: Option<ProviderError>,
    image_error: Option<ProviderError>,
    running_times_out: bool,
    port_times_out: bool,
    terminate_error: Option<ProviderError>,
    next_instance: u32,
}

/// A scripted [`CloudProvider`] that records every call.
///
/// - Regions without scripted prices return an empty price map.
/// - Instance requests succeed unless a failure was scripted for that
///   (region, type); ids are `i-1`, `i-2`, ... and IPs `203.0.113.<n>`.
/// - Credentials behave like the real control plane: creating a name that
///   already exists fails with `InvalidKeyPair.Duplicate`.
#[derive(Clone, Default)]
pub struct FakeProvider {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<ProviderCall>>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices(self, region: &str, prices: PriceMap) -> Self {
        self.script
            .lock()
            .unwrap()
            .prices
            .insert(region.to_string(), Ok(prices));
        self
    }

    pub fn with_price_error(self, region: &str, code: &str) -> Self {
        self.script.lock().unwrap().prices.insert(
            region.to_string(),
            Err(ProviderError::new(code, "price lookup failed")),
        );
        self
    }

    /// Make requests for `instance_type` in `region` fail with `code`.
    pub fn fail_request(self, region: &str, instance_type: &str, code: &str, message: &str) -> Self {
        self.script.lock().unwrap().request_errors.insert(
            (region.to_string(), instance_type.to_string()),
            ProviderError::new(code, message),
        );
        self
    }

    pub fn with_existing_credential(self, region: &str, name: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .credentials
            .insert((region.to_string(), name.to_string()));
        self
    }

    pub fn fail_describe(self, code: &str) -> Self {
        self.script.lock().unwrap().describe_error = Some(ProviderError::new(code, "describe failed"));
        self
    }

    pub fn fail_image(self, code: &str) -> Self {
        self.script.lock().unwrap().image_error = Some(ProviderError::new(code, "no image"));
        self
    }

    pub fn time_out_running(self) -> Self {
        self.script.lock().unwrap().running_times_out = true;
        self
    }

    pub fn time_out_port(self) -> Self {
        self.script.lock().unwrap().port_times_out = true;
        self
    }

    pub fn fail_terminate(self, code: &str) -> Self {
        self.script.lock().unwrap().terminate_error = Some(ProviderError::new(code, "terminate failed"));
        self
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    /// (region, instance type) of every instance request, in order.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::RequestInstance {
                    region,
                    instance_type,
                    ..
                } => Some((region, instance_type)),
                _ => None,
            })
            .collect()
    }

    pub fn credential_creates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::CreateCredential { region, .. } => Some(region),
                _ => None,
            })
            .collect()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::Terminate { instance_id, .. } => Some(instance_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ProviderCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CloudProvider for FakeProvider {
    fn get_spot_prices<'a>(
        &'a self,
        region: &'a str,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, Result<PriceMap>> {
        Box::pin(async move {
            self.record(ProviderCall::GetSpotPrices {
                region: region.to_string(),
            });
            let scripted = self.script.lock().unwrap().prices.get(region).cloned();
            match scripted {
                Some(Ok(prices)) => Ok(prices
                    .into_iter()
                    .filter(|(t, _)| instance_types.contains(t))
                    .collect()),
                Some(Err(e)) => Err(e.into()),
                None => Ok(PriceMap::new()),
            }
        })
    }

    fn describe_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(ProviderCall::DescribeCredential {
                region: region.to_string(),
                name: name.to_string(),
            });
            // Give concurrent callers a chance to interleave between the
            // existence check and the create.
            tokio::task::yield_now().await;
            let script = self.script.lock().unwrap();
            if let Some(e) = &script.describe_error {
                return Err(e.clone().into());
            }
            if script
                .credentials
                .contains(&(region.to_string(), name.to_string()))
            {
                Ok(())
            } else {
                Err(ProviderError::new(
                    "InvalidKeyPair.NotFound",
                    format!("The key pair '{name}' does not exist"),
                )
                .into())
            }
        })
    }

    fn create_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(ProviderCall::CreateCredential {
                region: region.to_string(),
                name: name.to_string(),
            });
            tokio::task::yield_now().await;
            let inserted = self
                .script
                .lock()
                .unwrap()
                .credentials
                .insert((region.to_string(), name.to_string()));
            if !inserted {
                return Err(ProviderError::new(
                    "InvalidKeyPair.Duplicate",
                    format!("The keypair '{name}' already exists."),
                )
                .into());
            }
            Ok(format!("-----BEGIN FAKE KEY {name}-----\n"))
        })
    }

    fn delete_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(ProviderCall::DeleteCredential {
                region: region.to_string(),
                name: name.to_string(),
            });
            self.script
                .lock()
                .unwrap()
                .credentials
                .remove(&(region.to_string(), name.to_string()));
            Ok(())
        })
    }

    fn ensure_ingress_rule<'a>(
        &'a self,
        region: &'a str,
        group_name: &'a str,
        _project_tag: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(ProviderCall::EnsureIngressRule {
                region: region.to_string(),
                group: group_name.to_string(),
            });
            Ok(format!("sg-{group_name}-{region}"))
        })
    }

    fn find_image<'a>(
        &'a self,
        region: &'a str,
        _project_tag: &'a str,
        arch: Arch,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(ProviderCall::FindImage {
                region: region.to_string(),
                arch,
            });
            if let Some(e) = &self.script.lock().unwrap().image_error {
                return Err(e.clone().into());
            }
            Ok(format!("ami-{arch}-{region}"))
        })
    }

    fn request_instance<'a>(
        &'a self,
        region: &'a str,
        request: &'a InstanceRequest,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(ProviderCall::RequestInstance {
                region: region.to_string(),
                instance_type: request.instance_type.clone(),
                cpu_topology: request.cpu_topology,
            });
            let mut script = self.script.lock().unwrap();
            let key = (region.to_string(), request.instance_type.clone());
            if let Some(e) = script.request_errors.get(&key) {
                return Err(e.clone().into());
            }
            script.next_instance += 1;
            Ok(format!("i-{}", script.next_instance))
        })
    }

    fn wait_until_running<'a>(
        &'a self,
        region: &'a str,
        instance_id: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(ProviderCall::WaitUntilRunning {
                region: region.to_string(),
                instance_id: instance_id.to_string(),
            });
            if self.script.lock().unwrap().running_times_out {
                return Err(SpotrunError::Timeout {
                    what: format!("{instance_id} to reach running"),
                    after_secs: timeout.as_secs(),
                });
            }
            let n = instance_id.trim_start_matches("i-");
            Ok(format!("203.0.113.{n}"))
        })
    }

    fn terminate<'a>(&'a self, region: &'a str, instance_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(ProviderCall::Terminate {
                region: region.to_string(),
                instance_id: instance_id.to_string(),
            });
            match &self.script.lock().unwrap().terminate_error {
                Some(e) => Err(e.clone().into()),
                None => Ok(()),
            }
        })
    }

    fn wait_for_management_port<'a>(&'a self, ip: &'a str, timeout: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(ProviderCall::WaitForManagementPort { ip: ip.to_string() });
            if self.script.lock().unwrap().port_times_out {
                return Err(SpotrunError::Timeout {
                    what: format!("SSH on {ip}"),
                    after_secs: timeout.as_secs(),
                });
            }
            Ok(())
        })
    }
}
