//! Device bridge seam
//!
//! The inspector never talks to devices directly. Everything it needs from
//! the device bridge (listing devices and abstract sockets, opening and
//! removing tunnels, one-off shell commands) goes through [`DeviceBridge`],
//! with [`AdbBridge`] as the implementation backed by the `adb` executable.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// A connected device as reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Bridge-assigned serial
    pub id: String,
    /// Human-readable title (model name when known)
    pub title: String,
}

impl Device {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
        }
    }
}

/// Errors returned by a device bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unexpected output from `{command}`: {output}")]
    UnexpectedOutput { command: String, output: String },

    #[error("`{operation}` timed out after {timeout_ms}ms")]
    TimedOut { operation: String, timeout_ms: u64 },
}

/// Operations the inspector needs from the device bridge
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// List devices that are online
    async fn list_devices(&self) -> Result<Vec<Device>, BridgeError>;

    /// List the names of abstract sockets a device exposes (without the `@`)
    async fn list_abstract_sockets(&self, device_id: &str) -> Result<Vec<String>, BridgeError>;

    /// Forward a free local TCP port to an abstract socket, returning the port
    async fn forward(&self, device_id: &str, socket_name: &str) -> Result<u16, BridgeError>;

    /// Remove a tunnel created by [`DeviceBridge::forward`]
    async fn remove_forward(&self, device_id: &str, local_port: u16) -> Result<(), BridgeError>;

    /// Run a shell command on the device and return its stdout
    async fn shell(&self, device_id: &str, command: &str) -> Result<String, BridgeError>;
}

/// [`DeviceBridge`] backed by the `adb` executable
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let command = format!("{} {}", self.adb_path.display(), args.join(" "));
        debug!("Running {}", command);

        let output = Command::new(&self.adb_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BridgeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BridgeError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<Device>, BridgeError> {
        let output = self.run(&["devices", "-l"]).await?;
        Ok(parse_device_list(&output))
    }

    async fn list_abstract_sockets(&self, device_id: &str) -> Result<Vec<String>, BridgeError> {
        let output = self
            .run(&["-s", device_id, "shell", "cat", "/proc/net/unix"])
            .await?;
        Ok(parse_abstract_sockets(&output))
    }

    async fn forward(&self, device_id: &str, socket_name: &str) -> Result<u16, BridgeError> {
        let target = format!("localabstract:{socket_name}");
        let output = self
            .run(&["-s", device_id, "forward", "tcp:0", &target])
            .await?;
        output
            .trim()
            .parse::<u16>()
            .map_err(|_| BridgeError::UnexpectedOutput {
                command: format!("forward tcp:0 {target}"),
                output: output.trim().to_string(),
            })
    }

    async fn remove_forward(&self, device_id: &str, local_port: u16) -> Result<(), BridgeError> {
        let local = format!("tcp:{local_port}");
        self.run(&["-s", device_id, "forward", "--remove", &local])
            .await
            .map(|_| ())
    }

    async fn shell(&self, device_id: &str, command: &str) -> Result<String, BridgeError> {
        self.run(&["-s", device_id, "shell", command]).await
    }
}

/// Parse `adb devices -l` output, keeping only devices in the `device` state
pub fn parse_device_list(output: &str) -> Vec<Device> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            if state != "device" {
                return None;
            }
            let title = fields
                .find_map(|field| field.strip_prefix("model:"))
                .map(|model| model.replace('_', " "))
                .unwrap_or_else(|| serial.to_string());
            Some(Device::new(serial, title))
        })
        .collect()
}

/// Parse `/proc/net/unix`, returning abstract socket names without the `@`
pub fn parse_abstract_sockets(output: &str) -> Vec<String> {
    let names: BTreeSet<String> = output
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|path| path.strip_prefix('@'))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    names.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable bridge for tests

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeBridge {
        devices: Mutex<Vec<Device>>,
        sockets: Mutex<HashMap<String, Vec<String>>>,
        failing_devices: Mutex<HashSet<String>>,
        ports: Mutex<HashMap<String, u16>>,
        hanging: Mutex<HashSet<String>>,
        forward_delays: Mutex<HashMap<String, std::time::Duration>>,
        failing_removals: Mutex<HashSet<u16>>,
        shell_output: Mutex<HashMap<String, String>>,
        removed_forwards: Mutex<Vec<(String, u16)>>,
        list_calls: Mutex<usize>,
    }

    impl FakeBridge {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_devices(&self, devices: Vec<Device>) {
            *self.devices.lock().unwrap() = devices;
        }

        pub fn set_sockets(&self, device_id: &str, sockets: &[&str]) {
            self.sockets.lock().unwrap().insert(
                device_id.to_string(),
                sockets.iter().map(|s| s.to_string()).collect(),
            );
        }

        pub fn fail_listing(&self, device_id: &str, fail: bool) {
            let mut failing = self.failing_devices.lock().unwrap();
            if fail {
                failing.insert(device_id.to_string());
            } else {
                failing.remove(device_id);
            }
        }

        /// Route tunnels for `socket_name` to a loopback port owned by the test
        pub fn route(&self, socket_name: &str, port: u16) {
            self.ports
                .lock()
                .unwrap()
                .insert(socket_name.to_string(), port);
        }

        /// Make tunnel requests for `socket_name` never complete
        pub fn hang_forward(&self, socket_name: &str) {
            self.hanging
                .lock()
                .unwrap()
                .insert(socket_name.to_string());
        }

        /// Make tunnel requests for `socket_name` take `delay` to complete
        pub fn delay_forward(&self, socket_name: &str, delay: std::time::Duration) {
            self.forward_delays
                .lock()
                .unwrap()
                .insert(socket_name.to_string(), delay);
        }

        /// Make removing the tunnel on `local_port` fail
        pub fn fail_remove_forward(&self, local_port: u16) {
            self.failing_removals.lock().unwrap().insert(local_port);
        }

        pub fn set_shell_output(&self, command: &str, output: &str) {
            self.shell_output
                .lock()
                .unwrap()
                .insert(command.to_string(), output.to_string());
        }

        /// Every tunnel removal requested, failed ones included
        pub fn removed_forwards(&self) -> Vec<(String, u16)> {
            self.removed_forwards.lock().unwrap().clone()
        }

        pub fn list_calls(&self) -> usize {
            *self.list_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl DeviceBridge for FakeBridge {
        async fn list_devices(&self) -> Result<Vec<Device>, BridgeError> {
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn list_abstract_sockets(
            &self,
            device_id: &str,
        ) -> Result<Vec<String>, BridgeError> {
            *self.list_calls.lock().unwrap() += 1;
            if self.failing_devices.lock().unwrap().contains(device_id) {
                return Err(BridgeError::CommandFailed {
                    command: "cat /proc/net/unix".to_string(),
                    stderr: "device offline".to_string(),
                });
            }
            Ok(self
                .sockets
                .lock()
                .unwrap()
                .get(device_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn forward(&self, _device_id: &str, socket_name: &str) -> Result<u16, BridgeError> {
            let hangs = self.hanging.lock().unwrap().contains(socket_name);
            if hangs {
                std::future::pending::<()>().await;
            }
            let delay = self.forward_delays.lock().unwrap().get(socket_name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.ports
                .lock()
                .unwrap()
                .get(socket_name)
                .copied()
                .ok_or_else(|| BridgeError::CommandFailed {
                    command: format!("forward localabstract:{socket_name}"),
                    stderr: "cannot bind listener".to_string(),
                })
        }

        async fn remove_forward(&self, device_id: &str, local_port: u16) -> Result<(), BridgeError> {
            self.removed_forwards
                .lock()
                .unwrap()
                .push((device_id.to_string(), local_port));
            if self.failing_removals.lock().unwrap().contains(&local_port) {
                return Err(BridgeError::CommandFailed {
                    command: format!("forward --remove tcp:{local_port}"),
                    stderr: "listener not found".to_string(),
                });
            }
            Ok(())
        }

        async fn shell(&self, _device_id: &str, command: &str) -> Result<String, BridgeError> {
            self.shell_output
                .lock()
                .unwrap()
                .get(command)
                .cloned()
                .ok_or_else(|| BridgeError::CommandFailed {
                    command: command.to_string(),
                    stderr: "not found".to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "\
List of devices attached
emulator-5554          device product:sdk_gphone64 model:sdk_gphone64_arm64 device:emu64a transport_id:1
R58M12345              unauthorized usb:1-1 transport_id:2
0A1B2C3D               device usb:1-2 transport_id:3

";
        let devices = parse_device_list(output);
        assert_eq!(
            devices,
            vec![
                Device::new("emulator-5554", "sdk gphone64 arm64"),
                Device::new("0A1B2C3D", "0A1B2C3D"),
            ]
        );
    }

    #[test]
    fn test_parse_device_list_ignores_daemon_banner() {
        let output = "\
* daemon not running; starting now at tcp:5037
* daemon started successfully
List of devices attached
emulator-5556\tdevice
";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "emulator-5556");
    }

    #[test]
    fn test_parse_abstract_sockets() {
        let output = "\
Num       RefCount Protocol Flags    Type St Inode Path
0000000000000000: 00000002 00000000 00010000 0001 01 34567 @snapo_server_4321
0000000000000000: 00000002 00000000 00010000 0001 01 34568 @jdwp-control
0000000000000000: 00000003 00000000 00000000 0001 03 34569
0000000000000000: 00000002 00000000 00010000 0001 01 34570 /dev/socket/zygote
0000000000000000: 00000002 00000000 00010000 0001 01 34571 @snapo_server_4321
";
        let sockets = parse_abstract_sockets(output);
        assert_eq!(sockets, vec!["jdwp-control", "snapo_server_4321"]);
    }

    #[tokio::test]
    async fn test_adb_bridge_spawn_failure() {
        let bridge = AdbBridge::new("/nonexistent/adb");
        let err = bridge.list_devices().await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }
}
