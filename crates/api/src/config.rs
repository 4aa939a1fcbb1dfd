//! Types for use when configuring shuffle modules.

use crate::*;
use std::sync::Mutex;

/// helper transcode function
fn tc<S: serde::Serialize, D: serde::de::DeserializeOwned>(
    s: &S,
) -> ShuffleResult<D> {
    serde_json::from_str(
        &serde_json::to_string(s)
            .map_err(|e| ShuffleError::other_src("encode", e))?,
    )
    .map_err(|e| ShuffleError::other_src("decode", e))
}

/// Denotes a type used to configure a specific shuffle module.
///
/// A module config is a struct with a single top-level property named after
/// the module, wrapping the actual configuration of that module, e.g.
/// `{ "transport": { "ioMaxRetries": 3 } }`. All module configs of a
/// process share one [Config] object.
///
/// Module configs are loaded from files edited by humans, so they should
/// be tolerant to missing properties (`#[serde(default)]`).
pub trait ModConfig:
    'static
    + Sized
    + Default
    + std::fmt::Debug
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
{
}

impl<T> ModConfig for T where
    T: 'static
        + Sized
        + Default
        + std::fmt::Debug
        + serde::Serialize
        + serde::de::DeserializeOwned
        + Send
        + Sync
{
}

/// Shuffle configuration.
#[derive(Debug, Default)]
pub struct Config(Mutex<serde_json::Map<String, serde_json::Value>>);

impl serde::Serialize for Config {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.lock().unwrap().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let map: serde_json::Map<String, serde_json::Value> =
            serde::Deserialize::deserialize(deserializer)?;
        Ok(Self(Mutex::new(map)))
    }
}

impl Config {
    /// Merge the top-level properties of a module config into this config,
    /// overwriting any properties of the same name.
    pub fn set_module_config<M: ModConfig>(&self, m: &M) -> ShuffleResult<()> {
        let value: serde_json::Value = tc(m)?;
        let serde_json::Value::Object(value) = value else {
            return Err(ShuffleError::other(
                "module config must serialize to an object",
            ));
        };
        let mut lock = self.0.lock().unwrap();
        for (k, v) in value {
            lock.insert(k, v);
        }
        Ok(())
    }

    /// Extract a module config. Properties of other modules are ignored,
    /// properties not set fall back to the module defaults.
    pub fn get_module_config<M: ModConfig>(&self) -> ShuffleResult<M> {
        let lock = self.0.lock().unwrap();
        tc(&*lock)
    }
}
