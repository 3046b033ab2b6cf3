use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::sandbox::channel::Limits;
use crate::sandbox::image::ImageSpec;
use crate::sandbox::manifest::ManifestSettings;

/// Manifest metadata overrides. Unset fields fall back to the launcher defaults.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ManifestConfig {
    pub node: Option<u32>,
    pub version: Option<String>,
    /// Seconds before the launcher kills the program. Default: 50
    pub timeout: Option<u64>,
    /// Memory budget in bytes. Default: 4 GiB
    pub memory: Option<u64>,
}

impl ManifestConfig {
    pub fn settings(&self) -> ManifestSettings {
        let defaults = ManifestSettings::default();
        ManifestSettings {
            node: self.node.unwrap_or(defaults.node),
            version: self.version.clone().unwrap_or(defaults.version),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            memory: self.memory.unwrap_or(defaults.memory),
        }
    }

    fn merge(self, project: Self) -> Self {
        Self {
            node: project.node.or(self.node),
            version: project.version.or(self.version),
            timeout: project.timeout.or(self.timeout),
            memory: project.memory.or(self.memory),
        }
    }
}

/// Channel quota overrides, applied to every image, file and stdio channel.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct LimitsConfig {
    pub reads: Option<u64>,
    pub rbytes: Option<u64>,
    pub writes: Option<u64>,
    pub wbytes: Option<u64>,
}

impl LimitsConfig {
    pub fn limits(&self) -> Limits {
        let defaults = Limits::default();
        Limits {
            reads: self.reads.unwrap_or(defaults.reads),
            rbytes: self.rbytes.unwrap_or(defaults.rbytes),
            writes: self.writes.unwrap_or(defaults.writes),
            wbytes: self.wbytes.unwrap_or(defaults.wbytes),
        }
    }

    fn merge(self, project: Self) -> Self {
        Self {
            reads: project.reads.or(self.reads),
            rbytes: project.rbytes.or(self.rbytes),
            writes: project.writes.or(self.writes),
            wbytes: project.wbytes.or(self.wbytes),
        }
    }
}

/// Configuration for zvsh, read from `.zvsh.yaml` and `~/.config/zvsh/config.yaml`
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub manifest: ManifestConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Environment passed to the sandboxed program, in order.
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Images mounted on every run, in `path[,mountpoint[,access]]` form.
    /// Mounted before any `--zvm-image` given on the command line.
    #[serde(default)]
    pub fstab: Vec<String>,
}

impl Config {
    /// Load and merge global and project configurations.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let global_config = Self::load_global()?.unwrap_or_default();
        let project_config = Self::load_project()?.unwrap_or_default();
        let config = global_config.merge(project_config);
        debug!(
            env = config.env.len(),
            fstab = config.fstab.len(),
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/zvsh").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Load `.zvsh.yaml` or `.zvsh.yml` from the current directory.
    fn load_project() -> anyhow::Result<Option<Self>> {
        let cwd = std::env::current_dir().unwrap_or_default();
        Self::load_project_from(&cwd)
    }

    fn load_project_from(dir: &Path) -> anyhow::Result<Option<Self>> {
        for name in [".zvsh.yaml", ".zvsh.yml"] {
            let path = dir.join(name);
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        Ok(None)
    }

    /// Merge a project config into a global config.
    /// Project scalars win, env keys are overlaid in order, fstab entries are appended.
    fn merge(self, project: Self) -> Self {
        let mut env = self.env;
        env.extend(project.env);

        let mut fstab = self.fstab;
        fstab.extend(project.fstab);

        Self {
            manifest: self.manifest.merge(project.manifest),
            limits: self.limits.merge(project.limits),
            env,
            fstab,
        }
    }

    /// Parse the configured mount table.
    pub fn images(&self) -> anyhow::Result<Vec<ImageSpec>> {
        self.fstab
            .iter()
            .map(|spec| {
                spec.parse::<ImageSpec>()
                    .map_err(|e| anyhow::anyhow!("Invalid fstab entry in config: {}", e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, LimitsConfig, ManifestConfig};
    use crate::sandbox::channel::UNLIMITED;
    use crate::sandbox::nvram::MountAccess;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_launcher_defaults() {
        let config = Config::default();
        let settings = config.manifest.settings();
        assert_eq!(settings.node, 1);
        assert_eq!(settings.version, "20130611");
        assert_eq!(settings.timeout, 50);
        assert_eq!(settings.memory, 4294967296);
        assert_eq!(config.limits.limits().reads, UNLIMITED);
        assert!(config.images().unwrap().is_empty());
    }

    #[test]
    fn project_config_is_parsed() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(".zvsh.yaml"),
            "manifest:\n  timeout: 10\n  memory: 1024\n\
             limits:\n  reads: 16\n  wbytes: 128\n\
             env:\n  PATH: /bin\n  LANG: C\n\
             fstab:\n  - /opt/python.tar,/usr,rw\n",
        )
        .unwrap();

        let config = Config::load_project_from(temp.path()).unwrap().unwrap();
        let settings = config.manifest.settings();
        assert_eq!(settings.timeout, 10);
        assert_eq!(settings.memory, 1024);
        assert_eq!(settings.node, 1);

        let limits = config.limits.limits();
        assert_eq!(limits.reads, 16);
        assert_eq!(limits.rbytes, UNLIMITED);
        assert_eq!(limits.wbytes, 128);

        let keys: Vec<&str> = config.env.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["PATH", "LANG"]);

        let images = config.images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mountpoint, "/usr");
        assert_eq!(images[0].access, MountAccess::ReadWrite);
    }

    #[test]
    fn missing_project_config() {
        let temp = TempDir::new().unwrap();
        assert!(Config::load_project_from(temp.path()).unwrap().is_none());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".zvsh.yaml"), "manifest: [unclosed").unwrap();
        assert!(Config::load_project_from(temp.path()).is_err());
    }

    #[test]
    fn project_overrides_global() {
        let global = Config {
            manifest: ManifestConfig {
                timeout: Some(100),
                version: Some("20130611".to_string()),
                ..Default::default()
            },
            limits: LimitsConfig {
                reads: Some(1),
                ..Default::default()
            },
            env: [("A", "global"), ("B", "global")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fstab: vec!["/global.tar".to_string()],
        };
        let project = Config {
            manifest: ManifestConfig {
                timeout: Some(5),
                ..Default::default()
            },
            env: [("B", "project"), ("C", "project")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fstab: vec!["/project.tar,/opt".to_string()],
            ..Default::default()
        };

        let merged = global.merge(project);
        assert_eq!(merged.manifest.timeout, Some(5));
        assert_eq!(merged.manifest.version.as_deref(), Some("20130611"));
        assert_eq!(merged.limits.reads, Some(1));
        let env: Vec<(&str, &str)> = merged
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            env,
            vec![("A", "global"), ("B", "project"), ("C", "project")]
        );
        assert_eq!(merged.fstab, vec!["/global.tar", "/project.tar,/opt"]);
    }

    #[test]
    fn bad_fstab_entry_is_reported() {
        let config = Config {
            fstab: vec!["/a.tar,/,bogus".to_string()],
            ..Default::default()
        };
        assert!(config.images().is_err());
    }
}
