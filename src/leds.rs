// Enclosure LED control: a registry of device indicator states driven
// through an external ledctl-style command.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Deserializer};

use crate::models::Pool;

/// SGPIO/IBPI indicator patterns understood by the LED tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedIndicator {
    #[default]
    Unknown,
    Normal,
    Locate,
    LocateOff,
    Fail,
    RebuildP,
    RebuildS,
    Pfa,
    Hotspare,
    CriticalArray,
    FailedArray,
    Undefined,
}

impl LedIndicator {
    /// Command-line token the LED tool expects; `None` means the device
    /// is left out of the invocation.
    fn ledctl_arg(self) -> Option<&'static str> {
        match self {
            LedIndicator::Normal => Some("normal"),
            LedIndicator::Locate => Some("locate"),
            LedIndicator::LocateOff => Some("locate_off"),
            LedIndicator::Fail => Some("failure"),
            LedIndicator::RebuildP => Some("rebuild_p"),
            LedIndicator::RebuildS => Some("rebuild"),
            LedIndicator::Pfa => Some("pfa"),
            LedIndicator::Hotspare => Some("hotspare"),
            LedIndicator::CriticalArray => Some("degraded"),
            LedIndicator::FailedArray => Some("failed_array"),
            LedIndicator::Unknown | LedIndicator::Undefined => None,
        }
    }
}

impl FromStr for LedIndicator {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "normal" => LedIndicator::Normal,
            "locate" => LedIndicator::Locate,
            "fail" => LedIndicator::Fail,
            "rebuild" | "rebuild_p" => LedIndicator::RebuildP,
            "rebuild_s" => LedIndicator::RebuildS,
            "pfa" => LedIndicator::Pfa,
            "hotspare" => LedIndicator::Hotspare,
            "critical_array" => LedIndicator::CriticalArray,
            "failed_array" => LedIndicator::FailedArray,
            "undefined" => LedIndicator::Undefined,
            _ => bail!(r#"invalid LED indicator "{s}""#),
        })
    }
}

impl<'de> Deserialize<'de> for LedIndicator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// Device lookup directories, most specific first. (The Linux list
// follows the lookup order of the upstream volume manager library.)
#[cfg(target_os = "linux")]
const DEVICE_LOOKUP_PATHS: &[&str] = &[
    "/dev/disk/by-vdev",
    "/dev/disk/zpool",
    "/dev/mapper",
    "/dev/disk/by-uuid",
    "/dev/disk/by-id",
    "/dev/disk/by-path",
    "/dev/disk/by-label",
    "/dev",
];
#[cfg(target_os = "freebsd")]
const DEVICE_LOOKUP_PATHS: &[&str] = &["/dev"];
#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
const DEVICE_LOOKUP_PATHS: &[&str] = &["/dev/dsk", "/dev"];

fn is_device_file(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device() || m.file_type().is_char_device())
        .unwrap_or(false)
}

/// Resolves a bare device name to its path: the first lookup directory
/// whose entry stats as a device file wins.
pub fn find_device_path(dev: &str) -> Result<PathBuf> {
    for prefix in DEVICE_LOOKUP_PATHS {
        let path = Path::new(prefix).join(dev);
        if is_device_file(&path) {
            return Ok(path);
        }
    }
    bail!(r#"device "{dev}" not found"#)
}

#[derive(Debug)]
struct DevLed {
    path: PathBuf,
    state: LedIndicator,
    locate: bool,
}

/// Registry of every device the daemon has driven an indicator for.
/// Entries are created lazily on first reference; the operator locate
/// flag overrides the monitored state until cleared.
pub struct LedRegistry {
    ledctl_cmd: String,
    devs: Mutex<BTreeMap<String, DevLed>>,
}

impl LedRegistry {
    pub fn new(ledctl_cmd: impl Into<String>) -> Self {
        LedRegistry {
            ledctl_cmd: ledctl_cmd.into(),
            devs: Mutex::new(BTreeMap::new()),
        }
    }

    fn ensure_entry(devs: &mut BTreeMap<String, DevLed>, dev: &str) -> Result<()> {
        if devs.contains_key(dev) {
            return Ok(());
        }
        let path = find_device_path(dev)?;
        devs.insert(
            dev.to_string(),
            DevLed {
                path,
                state: LedIndicator::Unknown,
                locate: false,
            },
        );
        Ok(())
    }

    /// Applies new monitored states and pushes the complete indicator
    /// set for every known device to the LED tool: the tool turns
    /// unlisted indicators off, so partial invocations are never safe.
    /// Devices whose files have vanished are skipped; an unresolvable
    /// device loses its LED update but nothing else.
    pub async fn set_leds(&self, changes: &HashMap<String, LedIndicator>) -> Result<()> {
        let args = {
            let mut devs = self
                .devs
                .lock()
                .map_err(|e| anyhow!("LED registry lock poisoned: {e}"))?;
            for (dev, &indicator) in changes {
                if let Err(e) = Self::ensure_entry(&mut devs, dev) {
                    tracing::error!("failed setting LED: {e}");
                    continue;
                }
                if let Some(led) = devs.get_mut(dev) {
                    led.state = indicator;
                }
            }
            let mut args = Vec::new();
            for (dev, led) in devs.iter_mut() {
                if !is_device_file(&led.path) {
                    tracing::debug!("skipping missing device LED: {dev}");
                    continue;
                }
                if led.state == LedIndicator::Unknown {
                    led.state = LedIndicator::Normal;
                }
                let indicator = if led.locate { LedIndicator::Locate } else { led.state };
                if let Some(arg) = indicator.ledctl_arg() {
                    args.push(format!("{}={}", arg, led.path.display()));
                }
            }
            args
        };

        if args.is_empty() {
            return Ok(());
        }
        let status = tokio::process::Command::new(&self.ledctl_cmd)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(st) if st.success() => Ok(()),
            Ok(st) => bail!(r#"running "{} {}" failed: {st}"#, self.ledctl_cmd, args.join(" ")),
            Err(e) => bail!(r#"running "{}" failed: {e}"#, self.ledctl_cmd),
        }
    }

    /// Forces a device's indicator to the locate pattern regardless of
    /// its monitored state.
    pub async fn locate_on(&self, dev: &str) -> Result<()> {
        self.set_locate(dev, true)?;
        self.set_leds(&HashMap::new()).await
    }

    pub async fn locate_off(&self, dev: &str) -> Result<()> {
        self.set_locate(dev, false)?;
        self.set_leds(&HashMap::new()).await
    }

    fn set_locate(&self, dev: &str, locate: bool) -> Result<()> {
        let mut devs = self
            .devs
            .lock()
            .map_err(|e| anyhow!("LED registry lock poisoned: {e}"))?;
        Self::ensure_entry(&mut devs, dev)?;
        if let Some(led) = devs.get_mut(dev) {
            led.locate = locate;
        }
        Ok(())
    }

    pub fn locate_query(&self, dev: &str) -> Result<bool> {
        let mut devs = self
            .devs
            .lock()
            .map_err(|e| anyhow!("LED registry lock poisoned: {e}"))?;
        Self::ensure_entry(&mut devs, dev)?;
        Ok(devs.get(dev).is_some_and(|led| led.locate))
    }
}

/// Indicator states for every leaf device of the given pools, used to
/// light the enclosure correctly right after startup.
pub fn initial_led_states(
    pools: &[Pool],
    state_map: &HashMap<String, LedIndicator>,
) -> HashMap<String, LedIndicator> {
    pools
        .iter()
        .flat_map(|p| p.devs.iter())
        .filter(|d| !d.is_container())
        .map(|d| {
            let indicator = state_map.get(&d.state).copied().unwrap_or(LedIndicator::Normal);
            (d.name.clone(), indicator)
        })
        .collect()
}
