//! User-facing pod specification.
//!
//! This is the JSON shape accepted by `POST /pod/create`. Field names follow
//! the wire format; everything beyond the container list is optional.

use serde::{Deserialize, Serialize};

/// A pod: a set of containers sharing one sandbox VM and its network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPod {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    pub containers: Vec<UserContainer>,
    #[serde(default)]
    pub volumes: Vec<UserVolume>,
    #[serde(default)]
    pub interfaces: Vec<UserInterface>,
    #[serde(default)]
    pub routes: Vec<UserRoute>,
    #[serde(default)]
    pub resource: PodResource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContainer {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub envs: Vec<UserEnv>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub tty: String,
    #[serde(default)]
    pub volumes: Vec<UserVolumeRef>,
    #[serde(default)]
    pub fsmap: Vec<UserFsmap>,
    #[serde(default)]
    pub ports: Vec<UserPortMapping>,
    #[serde(default, rename = "restartPolicy")]
    pub restart_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEnv {
    pub env: String,
    pub value: String,
}

/// Reference from a container to a pod-level volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserVolumeRef {
    pub volume: String,
    pub mount: String,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
}

/// A host directory mapped into the container through the shared dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFsmap {
    pub source: String,
    pub path: String,
    #[serde(default, rename = "readOnly")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPortMapping {
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    #[serde(rename = "containerPort")]
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// A pod-level volume. An empty `source` asks the storage pool to allocate a
/// fresh thin device; a non-empty source names an existing host block device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserVolume {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInterface {
    /// Requested IPv4 address; empty lets the bridge allocator pick one.
    #[serde(default)]
    pub ip: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRoute {
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodResource {
    pub vcpu: u32,
    pub memory: u64,
}

impl Default for PodResource {
    fn default() -> Self {
        Self {
            vcpu: 1,
            memory: 128,
        }
    }
}

impl UserPod {
    /// Basic admission checks: container ids unique, volume references
    /// resolvable, volume names unique.
    pub fn validate(&self) -> Result<(), String> {
        if self.containers.is_empty() {
            return Err("pod has no containers".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for c in &self.containers {
            if c.id.is_empty() {
                return Err("container id must not be empty".to_string());
            }
            if !seen.insert(c.id.as_str()) {
                return Err(format!("duplicate container id {}", c.id));
            }
        }
        let mut vols = std::collections::HashSet::new();
        for v in &self.volumes {
            if !vols.insert(v.name.as_str()) {
                return Err(format!("duplicate volume {}", v.name));
            }
        }
        for c in &self.containers {
            for r in &c.volumes {
                if !vols.contains(r.volume.as_str()) {
                    return Err(format!(
                        "container {} references unknown volume {}",
                        c.id, r.volume
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_parses() {
        let spec: UserPod = serde_json::from_str(
            r#"{"containers":[{"id":"c1","image":"img1","cmd":["/bin/echo","hi"]}]}"#,
        )
        .unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].cmd, vec!["/bin/echo", "hi"]);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.resource.vcpu, 1);
    }

    #[test]
    fn duplicate_container_rejected() {
        let spec: UserPod = serde_json::from_str(
            r#"{"containers":[{"id":"c1","image":"a"},{"id":"c1","image":"b"}]}"#,
        )
        .unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn unknown_volume_reference_rejected() {
        let spec: UserPod = serde_json::from_str(
            r#"{"containers":[{"id":"c1","image":"a","volumes":[{"volume":"v1","mount":"/data"}]}]}"#,
        )
        .unwrap();
        assert!(spec.validate().is_err());
    }
}
