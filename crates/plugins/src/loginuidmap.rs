//! Adds the login user of the process behind an event.
//!
//! The audit login uid survives `su` and `sudo`, so it names the user who
//! logged in rather than the effective one. With `top_level: true` the uid is
//! read from the oldest ancestor in `proctree` instead of the process itself.
//!
//! Fields added: `loginuid` and, when the uid has a passwd entry, `loginname`.

use lineage_core::{
    event::Event,
    pdk::{ConfigError, Plugin, PluginError, PluginRecipe, ProbeSupport, Settings},
    procfs,
};
use nix::unistd::{Pid, Uid, User};
use serde_json::Value;

pub const PLUGIN_NAME: &str = "loginuidmap";

const PROBE_SUPPORT: ProbeSupport = ProbeSupport::Only(&["tcp_connect", "net_listen"]);

pub fn plugin() -> PluginRecipe {
    PluginRecipe::new(PLUGIN_NAME, PROBE_SUPPORT, |settings: &Settings| {
        Ok(LoginUidMap {
            config: Config::try_from(settings)?,
        })
    })
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    top_level: bool,
}

impl TryFrom<&Settings> for Config {
    type Error = ConfigError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        Ok(Self {
            top_level: settings.with_default("top_level", false)?,
        })
    }
}

struct LoginUidMap {
    config: Config,
}

impl LoginUidMap {
    fn target_pid(&self, event: &Event) -> Option<i32> {
        if self.config.top_level {
            let top = event
                .get("proctree")
                .and_then(Value::as_array)
                .and_then(|tree| tree.last())
                .and_then(|ancestor| ancestor.get("pid"))
                .and_then(Value::as_i64);
            if let Some(pid) = top {
                return Some(pid as i32);
            }
        }
        event.get("pid").and_then(Value::as_i64).map(|pid| pid as i32)
    }
}

impl Plugin for LoginUidMap {
    fn process(&self, mut event: Event) -> Result<Event, PluginError> {
        let Some(pid) = self.target_pid(&event) else {
            return Ok(event);
        };
        let loginuid = match procfs::get_process_loginuid(Pid::from_raw(pid)) {
            Ok(Some(loginuid)) => loginuid,
            Ok(None) => return Ok(event),
            Err(err) => {
                log::debug!("{PLUGIN_NAME}: {err}");
                return Ok(event);
            }
        };

        event.insert("loginuid".to_string(), Value::from(loginuid.as_raw()));
        if let Some(name) = login_name(loginuid) {
            event.insert("loginname".to_string(), Value::from(name));
        }
        Ok(event)
    }
}

fn login_name(uid: Uid) -> Option<String> {
    User::from_uid(uid).ok().flatten().map(|user| user.name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn loginuidmap(yaml: &str) -> Box<dyn Plugin> {
        let settings = Settings::new(serde_yaml::from_str(yaml).unwrap());
        (plugin().setup_fn)(&settings).unwrap()
    }

    fn own_loginuid() -> Option<Uid> {
        procfs::get_process_loginuid(Pid::this()).ok().flatten()
    }

    #[test]
    fn adds_own_loginuid() {
        let event = Event::new().with("pid", std::process::id());
        let event = loginuidmap("{}").process(event).unwrap();

        match own_loginuid() {
            Some(uid) => {
                assert_eq!(event["loginuid"], json!(uid.as_raw()));
                if let Some(name) = login_name(uid) {
                    assert_eq!(event["loginname"], json!(name));
                }
            }
            // no login session (e.g. started by init), nothing to add
            None => assert!(event.get("loginuid").is_none()),
        }
    }

    #[test]
    fn top_level_uses_the_oldest_ancestor() {
        let event = Event::new()
            .with("pid", i32::MAX)
            .with(
                "proctree",
                json!([{"pid": i32::MAX}, {"pid": std::process::id()}]),
            );
        let event = loginuidmap("{top_level: true}").process(event).unwrap();
        assert_eq!(event.get("loginuid").is_some(), own_loginuid().is_some());
    }

    #[test]
    fn vanished_process_is_left_alone() {
        let event = Event::new().with("pid", i32::MAX);
        let processed = loginuidmap("{}").process(event.clone()).unwrap();
        assert_eq!(processed, event);

        let event = Event::new().with("port", 22);
        assert_eq!(loginuidmap("{}").process(event.clone()).unwrap(), event);
    }

    #[test]
    fn invalid_top_level() {
        let settings = Settings::new(serde_yaml::from_str("{top_level: maybe}").unwrap());
        assert!((plugin().setup_fn)(&settings).is_err());
    }
}
