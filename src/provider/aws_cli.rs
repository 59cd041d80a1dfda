// src/provider/aws_cli.rs

//! [`CloudProvider`] backed by the `aws` command-line tool.
//!
//! Every operation is one `aws ec2 ...` invocation with JSON output, spawned
//! through `tokio::process`. Failures are parsed from the CLI's stderr into
//! a [`ProviderError`] so the engine can classify them by code.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{Result, SpotrunError};
use crate::pricing::PriceMap;
use crate::provider::wait::{wait_for_tcp_port, PollBudget};
use crate::provider::{BoxFuture, CloudProvider, InstanceRequest, ProviderError};
use crate::types::Arch;

/// Canonical's account id, owner of the stock Ubuntu images.
const CANONICAL_OWNER: &str = "099720109477";

const SSH_PORT: u16 = 22;

/// `An error occurred (InsufficientInstanceCapacity) when calling the RunInstances operation: ...`
static CLI_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"An error occurred \((?P<code>[^)]+)\)[^:]*:\s*(?P<message>.*)")
        .expect("static regex is valid")
});

/// Provider implementation that shells out to `aws`.
#[derive(Debug, Clone)]
pub struct AwsCliProvider {
    aws_bin: String,
    poll_interval: Duration,
}

impl Default for AwsCliProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl AwsCliProvider {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            aws_bin: "aws".to_string(),
            poll_interval,
        }
    }

    /// Use a different `aws` executable (e.g. a wrapper script).
    pub fn with_binary(mut self, aws_bin: impl Into<String>) -> Self {
        self.aws_bin = aws_bin.into();
        self
    }

    /// Run `aws --region <region> --output json ec2 <args...>` and parse stdout.
    async fn ec2(&self, region: &str, args: &[String]) -> Result<Value> {
        debug!(region = %region, args = ?args, "aws ec2");

        let output = Command::new(&self.aws_bin)
            .arg("--region")
            .arg(region)
            .arg("--output")
            .arg("json")
            .arg("ec2")
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning '{}'", self.aws_bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(parse_cli_error(&stderr).into());
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn instance_status(&self, region: &str, instance_id: &str) -> Result<(String, Option<String>)> {
        let resp = self
            .ec2(region, &args(["describe-instances", "--instance-ids", instance_id]))
            .await?;
        let instance = &resp["Reservations"][0]["Instances"][0];
        let state = instance["State"]["Name"].as_str().unwrap_or("unknown").to_string();
        let ip = instance["PublicIpAddress"].as_str().map(str::to_string);
        Ok((state, ip))
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Turn CLI stderr into a coded provider error.
pub fn parse_cli_error(stderr: &str) -> ProviderError {
    match CLI_ERROR_RE.captures(stderr) {
        Some(caps) => ProviderError::new(&caps["code"], caps["message"].trim()),
        None => ProviderError::new("CommandFailed", stderr.trim()),
    }
}

/// Cheapest price per type from a `describe-spot-price-history` response.
pub fn parse_spot_prices(resp: &Value) -> PriceMap {
    let mut prices = PriceMap::new();
    let Some(entries) = resp["SpotPriceHistory"].as_array() else {
        return prices;
    };
    for entry in entries {
        let (Some(itype), Some(price)) = (
            entry["InstanceType"].as_str(),
            entry["SpotPrice"].as_str().and_then(|p| p.parse::<f64>().ok()),
        ) else {
            continue;
        };
        prices
            .entry(itype.to_string())
            .and_modify(|p| *p = p.min(price))
            .or_insert(price);
    }
    prices
}

/// Newest image id from a `describe-images` response.
pub fn newest_image(resp: &Value) -> Option<String> {
    resp["Images"]
        .as_array()?
        .iter()
        .filter_map(|img| Some((img["CreationDate"].as_str()?, img["ImageId"].as_str()?)))
        .max_by(|a, b| a.0.cmp(b.0))
        .map(|(_, id)| id.to_string())
}

impl CloudProvider for AwsCliProvider {
    fn get_spot_prices<'a>(
        &'a self,
        region: &'a str,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, Result<PriceMap>> {
        Box::pin(async move {
            let mut cmd = args(["describe-spot-price-history", "--instance-types"]);
            cmd.extend(instance_types.iter().cloned());
            cmd.extend(args(["--product-descriptions", "Linux/UNIX", "--max-items"]));
            cmd.push((instance_types.len() * 10).to_string());

            let resp = self.ec2(region, &cmd).await?;
            Ok(parse_spot_prices(&resp))
        })
    }

    fn describe_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ec2(region, &args(["describe-key-pairs", "--key-names", name]))
                .await?;
            Ok(())
        })
    }

    fn create_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let resp = self
                .ec2(region, &args(["create-key-pair", "--key-name", name]))
                .await?;
            resp["KeyMaterial"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProviderError::new("MalformedResponse", "create-key-pair returned no KeyMaterial").into())
        })
    }

    fn delete_credential<'a>(&'a self, region: &'a str, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ec2(region, &args(["delete-key-pair", "--key-name", name]))
                .await?;
            Ok(())
        })
    }

    fn ensure_ingress_rule<'a>(
        &'a self,
        region: &'a str,
        group_name: &'a str,
        project_tag: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let filter = format!("Name=group-name,Values={group_name}");
            match self
                .ec2(region, &args(["describe-security-groups", "--filters", &filter]))
                .await
            {
                Ok(resp) => {
                    if let Some(id) = resp["SecurityGroups"][0]["GroupId"].as_str() {
                        debug!(region = %region, group = %group_name, group_id = %id, "security group exists");
                        return Ok(id.to_string());
                    }
                }
                Err(SpotrunError::Provider(e)) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            info!(region = %region, group = %group_name, "creating security group");
            let description = format!("SSH access for {project_tag}");
            let resp = self
                .ec2(
                    region,
                    &args([
                        "create-security-group",
                        "--group-name",
                        group_name,
                        "--description",
                        &description,
                    ]),
                )
                .await?;
            let group_id = resp["GroupId"]
                .as_str()
                .ok_or_else(|| ProviderError::new("MalformedResponse", "create-security-group returned no GroupId"))?
                .to_string();

            self.ec2(
                region,
                &args([
                    "authorize-security-group-ingress",
                    "--group-id",
                    &group_id,
                    "--protocol",
                    "tcp",
                    "--port",
                    "22",
                    "--cidr",
                    "0.0.0.0/0",
                ]),
            )
            .await?;

            let tag = format!("Key=Project,Value={project_tag}");
            self.ec2(region, &args(["create-tags", "--resources", &group_id, "--tags", &tag]))
                .await?;

            Ok(group_id)
        })
    }

    fn find_image<'a>(
        &'a self,
        region: &'a str,
        project_tag: &'a str,
        arch: Arch,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let arch_filter = format!("Name=architecture,Values={arch}");
            let tag_filter = format!("Name=tag:Project,Values={project_tag}");
            let own = self
                .ec2(
                    region,
                    &args([
                        "describe-images",
                        "--owners",
                        "self",
                        "--filters",
                        &tag_filter,
                        &arch_filter,
                        "Name=state,Values=available",
                    ]),
                )
                .await?;
            if let Some(id) = newest_image(&own) {
                debug!(region = %region, image = %id, arch = %arch, "using project image");
                return Ok(id);
            }

            let ubuntu_arch = match arch {
                Arch::X86_64 => "amd64",
                Arch::Arm64 => "arm64",
            };
            let name_filter = format!(
                "Name=name,Values=ubuntu/images/hvm-ssd-gp3/ubuntu-noble-24.04-{ubuntu_arch}-server-*"
            );
            let stock = self
                .ec2(
                    region,
                    &args([
                        "describe-images",
                        "--owners",
                        CANONICAL_OWNER,
                        "--filters",
                        &name_filter,
                        &arch_filter,
                        "Name=state,Values=available",
                    ]),
                )
                .await?;
            newest_image(&stock).ok_or_else(|| {
                ProviderError::new(
                    "InvalidAMIID.NotFound",
                    format!("No Ubuntu 24.04 ({arch}) image found in {region}"),
                )
                .into()
            })
        })
    }

    fn request_instance<'a>(
        &'a self,
        region: &'a str,
        request: &'a InstanceRequest,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let market = json!({
                "MarketType": "spot",
                "SpotOptions": { "SpotInstanceType": "one-time" }
            });
            let tags = json!([{
                "ResourceType": "instance",
                "Tags": [
                    { "Key": "Project", "Value": request.project_tag },
                    { "Key": "Name", "Value": format!("{}-worker", request.project_tag) }
                ]
            }]);

            let mut cmd = args([
                "run-instances",
                "--image-id",
                &request.image_id,
                "--instance-type",
                &request.instance_type,
                "--key-name",
                &request.credential_name,
                "--security-group-ids",
                &request.group_id,
                "--count",
                "1",
            ]);
            cmd.push("--instance-market-options".to_string());
            cmd.push(market.to_string());
            cmd.push("--tag-specifications".to_string());
            cmd.push(tags.to_string());
            if let Some(topology) = request.cpu_topology {
                cmd.push("--cpu-options".to_string());
                cmd.push(format!(
                    "CoreCount={},ThreadsPerCore={}",
                    topology.core_count, topology.threads_per_core
                ));
            }

            let resp = self.ec2(region, &cmd).await?;
            resp["Instances"][0]["InstanceId"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ProviderError::new("MalformedResponse", "run-instances returned no InstanceId").into())
        })
    }

    fn wait_until_running<'a>(
        &'a self,
        region: &'a str,
        instance_id: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let budget = PollBudget::new(timeout, self.poll_interval);
            for attempt in 1..=budget.max_attempts {
                let (state, ip) = self.instance_status(region, instance_id).await?;
                debug!(instance_id = %instance_id, state = %state, attempt, "instance state");
                match state.as_str() {
                    "running" => {
                        return ip.ok_or_else(|| {
                            ProviderError::new(
                                "NoPublicIp",
                                format!("Instance {instance_id} has no public IP"),
                            )
                            .into()
                        });
                    }
                    "shutting-down" | "terminated" | "stopped" | "stopping" => {
                        return Err(ProviderError::new(
                            "InstanceNotRunning",
                            format!("Instance {instance_id} entered state '{state}'"),
                        )
                        .into());
                    }
                    _ => {}
                }
                if attempt < budget.max_attempts {
                    tokio::time::sleep(budget.interval).await;
                }
            }
            Err(SpotrunError::Timeout {
                what: format!("instance {instance_id} to reach running"),
                after_secs: budget.total().as_secs(),
            })
        })
    }

    fn terminate<'a>(&'a self, region: &'a str, instance_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self
                .ec2(region, &args(["terminate-instances", "--instance-ids", instance_id]))
                .await
            {
                Ok(_) => {
                    info!(region = %region, instance_id = %instance_id, "terminated instance");
                    Ok(())
                }
                Err(SpotrunError::Provider(e)) if e.is_not_found() => {
                    debug!(instance_id = %instance_id, "instance already gone");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    fn wait_for_management_port<'a>(&'a self, ip: &'a str, timeout: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let budget = PollBudget::new(timeout, self.poll_interval);
            wait_for_tcp_port(ip, SSH_PORT, budget).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coded_cli_errors() {
        let err = parse_cli_error(
            "\nAn error occurred (InsufficientInstanceCapacity) when calling the RunInstances operation: \
             We currently do not have sufficient c6a.4xlarge capacity.\n",
        );
        assert_eq!(err.code, "InsufficientInstanceCapacity");
        assert!(err.message.starts_with("We currently"));
        assert!(err.is_capacity());

        let err = parse_cli_error("Unable to locate credentials.");
        assert_eq!(err.code, "CommandFailed");
    }

    #[test]
    fn keeps_cheapest_price_per_type() {
        let resp = json!({
            "SpotPriceHistory": [
                { "InstanceType": "c6a.4xlarge", "SpotPrice": "0.2100" },
                { "InstanceType": "c6a.4xlarge", "SpotPrice": "0.1900" },
                { "InstanceType": "c6a.8xlarge", "SpotPrice": "0.4000" },
                { "InstanceType": "c6a.8xlarge", "SpotPrice": "garbage" }
            ]
        });
        let prices = parse_spot_prices(&resp);
        assert_eq!(prices.len(), 2);
        assert!((prices["c6a.4xlarge"] - 0.19).abs() < 1e-9);
    }

    #[test]
    fn picks_newest_image() {
        let resp = json!({
            "Images": [
                { "ImageId": "ami-old", "CreationDate": "2024-01-01T00:00:00.000Z" },
                { "ImageId": "ami-new", "CreationDate": "2025-06-01T00:00:00.000Z" }
            ]
        });
        assert_eq!(newest_image(&resp).as_deref(), Some("ami-new"));
        assert_eq!(newest_image(&json!({ "Images": [] })), None);
    }
}
