//! The pod descriptor handed to the guest init over the channel.
//!
//! This is the START_POD payload: the fully-resolved view of the pod after
//! every block device and network interface has been hot-plugged, with guest
//! device names instead of host paths.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmPod {
    pub hostname: String,
    pub containers: Vec<VmContainer>,
    pub interfaces: Vec<VmInterface>,
    pub routes: Vec<VmRoute>,
    pub socket: String,
    #[serde(rename = "shareDir")]
    pub share_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmContainer {
    pub id: String,
    /// Guest device name of the rootfs, e.g. "sda".
    pub rootfs: String,
    pub fstype: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VmVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fsmap: Vec<VmFsmap>,
    pub tty: String,
    pub workdir: String,
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<VmEnv>,
    #[serde(rename = "restartPolicy")]
    pub restart_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVolume {
    pub device: String,
    pub mount: String,
    pub fstype: String,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmFsmap {
    pub source: String,
    pub path: String,
    #[serde(rename = "readOnly")]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmEnv {
    pub env: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInterface {
    pub device: String,
    #[serde(rename = "ipAddress")]
    pub ip_address: String,
    #[serde(rename = "netMask")]
    pub net_mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRoute {
    pub dest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names() {
        let pod = VmPod {
            hostname: "h".into(),
            containers: vec![VmContainer {
                id: "c1".into(),
                rootfs: "sda".into(),
                fstype: "ext4".into(),
                image: "img1".into(),
                volumes: vec![VmVolume {
                    device: "sdb".into(),
                    mount: "/data".into(),
                    fstype: "ext4".into(),
                    read_only: false,
                }],
                ..Default::default()
            }],
            interfaces: vec![VmInterface {
                device: "eth0".into(),
                ip_address: "10.11.0.2".into(),
                net_mask: "255.255.0.0".into(),
            }],
            routes: vec![],
            socket: "/run/vm/serial.sock".into(),
            share_dir: "share_dir".into(),
        };
        let v: serde_json::Value = serde_json::to_value(&pod).unwrap();
        assert_eq!(v["shareDir"], "share_dir");
        assert_eq!(v["containers"][0]["volumes"][0]["readOnly"], false);
        assert_eq!(v["interfaces"][0]["ipAddress"], "10.11.0.2");
        assert_eq!(v["interfaces"][0]["netMask"], "255.255.0.0");
        assert_eq!(v["containers"][0]["restartPolicy"], "");
    }
}
