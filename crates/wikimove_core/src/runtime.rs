use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const STATE_DIR_NAME: &str = ".wikimove";
pub const CONTENT_DIR_NAME: &str = "wiki_content";
pub const JOBS_DIR_NAME: &str = "jobs";
pub const DB_FILENAME: &str = "wikimove.db";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const SAMPLE_JOB_FILENAME: &str = "example-move.toml";

/// Where a resolved path came from, shown by `--diagnostics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    /// Nearest ancestor of the working directory holding a `.wikimove/` directory.
    Discovered,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Discovered => "discovered",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

/// Project layout: `wiki_content/` pages, `jobs/` job files, `.wikimove/` state.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub wiki_content_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        let lines = [
            ("project_root", &self.project_root, Some(self.root_source)),
            ("state_dir", &self.state_dir, None),
            ("wiki_content_dir", &self.wiki_content_dir, None),
            ("jobs_dir", &self.jobs_dir, None),
            ("data_dir", &self.data_dir, Some(self.data_source)),
            ("db_path", &self.db_path, None),
            ("config_path", &self.config_path, Some(self.config_source)),
        ];
        lines
            .iter()
            .map(|(key, path, source)| match source {
                Some(source) => format!("{key}={} ({})", normalize_for_display(path), source.as_str()),
                None => format!("{key}={}", normalize_for_display(path)),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What `wikimove init` has laid down so far.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub wiki_content_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl RuntimeStatus {
    pub fn inspect(paths: &ResolvedPaths) -> Self {
        let state_dir_exists = paths.state_dir.is_dir();
        let wiki_content_exists = paths.wiki_content_dir.is_dir();
        let config_exists = paths.config_path.is_file();

        let mut warnings = Vec::new();
        if !state_dir_exists {
            warnings.push(format!("{STATE_DIR_NAME}/ is missing; run `wikimove init` first"));
        }
        if !config_exists {
            warnings.push(format!(
                "{} is missing; built-in defaults are used",
                normalize_for_display(&paths.config_path)
            ));
        }
        if !wiki_content_exists {
            warnings.push(format!("{CONTENT_DIR_NAME}/ is missing; --local runs have nothing to work on"));
        }
        Self {
            state_dir_exists,
            wiki_content_exists,
            config_exists,
            warnings,
        }
    }

    /// Fails unless the local mirror layout exists.
    pub fn require_local_mirror(&self, paths: &ResolvedPaths) -> Result<()> {
        let missing: Vec<&str> = [
            (self.wiki_content_exists, CONTENT_DIR_NAME),
            (self.state_dir_exists, STATE_DIR_NAME),
        ]
        .into_iter()
        .filter_map(|(present, name)| (!present).then_some(name))
        .collect();
        if !missing.is_empty() {
            bail!(
                "Local mirror is not initialized (missing {}/).\nRun: wikimove init --project-root {}",
                missing.join("/, "),
                normalize_for_display(&paths.project_root)
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub sample_job: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            sample_job: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_sample_job: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = match pick_setting(
        overrides.project_root.as_deref(),
        lookup_env("WIKIMOVE_PROJECT_ROOT"),
        &context.cwd,
    ) {
        Some(found) => found,
        None => (discover_project_root(&context.cwd), ValueSource::Discovered),
    };
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = pick_setting(
        overrides.data_dir.as_deref(),
        lookup_env("WIKIMOVE_DATA_DIR"),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("data"), ValueSource::Default));
    let (config_path, config_source) = pick_setting(
        overrides.config.as_deref(),
        lookup_env("WIKIMOVE_CONFIG"),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join(CONFIG_FILENAME), ValueSource::Default));

    Ok(ResolvedPaths {
        wiki_content_dir: project_root.join(CONTENT_DIR_NAME),
        jobs_dir: project_root.join(JOBS_DIR_NAME),
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

/// Flag first, then a non-blank environment value; relative paths hang off `base`.
fn pick_setting(
    flag: Option<&Path>,
    env_value: Option<String>,
    base: &Path,
) -> Option<(PathBuf, ValueSource)> {
    if let Some(path) = flag {
        return Some((base.join(path), ValueSource::Flag));
    }
    let value = env_value?;
    let value = value.trim();
    (!value.is_empty()).then(|| (base.join(value), ValueSource::Env))
}

fn discover_project_root(cwd: &Path) -> PathBuf {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .unwrap_or(cwd)
        .to_path_buf()
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    let runs_dir = paths.state_dir.join("runs");
    for dir in [
        &paths.wiki_content_dir,
        &paths.jobs_dir,
        &paths.state_dir,
        &paths.data_dir,
        &runs_dir,
    ] {
        if dir.is_dir() {
            continue;
        }
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        created_dirs.push(dir.clone());
    }

    let wrote_config = options.materialize_config
        && write_text_file(&paths.config_path, &default_config(paths), options.force)?;
    let wrote_sample_job = options.sample_job
        && write_text_file(
            &paths.jobs_dir.join(SAMPLE_JOB_FILENAME),
            SAMPLE_JOB,
            options.force,
        )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_sample_job,
    })
}

fn default_config(paths: &ResolvedPaths) -> String {
    let data_dir = normalize_for_display(&paths.data_dir);
    format!(
        "# wikimove configuration (materialized by `wikimove init`)\n# Local mirror data lives under {data_dir}\n\n[wiki]\n# url = \"https://your-wiki.example.org\"\n# api_url = \"https://your-wiki.example.org/api.php\"\n# user_agent = \"wikimove/0.1\"\n# interwiki = [\"wikipedia\"]\n\n# [[wiki.custom_namespaces]]\n# name = \"Lore\"\n# id = 3000\n# aliases = [\"L\"]\n\n[engine]\nchunk_size = 50\nmax_save_retries = 3\nedit_summary = \"Updating links after page moves\"\nminor_edits = true\ndeletion_categories = [\"Candidates for deletion\"]\ndisambiguation_categories = [\"Disambiguation pages\"]\nredirect_namespaces = [0]\nleave_redirects = true\nmove_talk_pages = true\n",
    )
}

const SAMPLE_JOB: &str = "# Example job: `wikimove plan jobs/example-move.toml`\nkind = \"move-pages\"\nfollow_ups = [\"fix-links\", \"emit-report\", \"retain-direct-link-text\"]\n\n[[replacements]]\nfrom = \"Old page\"\nto = \"New page\"\nreason = \"example\"\n\n# [[templates]]\n# template = \"Main\"\n# handler = \"title\"\n# parameter = \"1\"\n";

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, RuntimeStatus,
        SAMPLE_JOB_FILENAME, ValueSource, init_layout, resolve_paths_with_lookup,
    };
    use crate::config::load_config;
    use crate::jobs::JobFile;

    fn rooted_at(root: &Path) -> ResolvedPaths {
        let context = ResolutionContext {
            cwd: root.to_path_buf(),
        };
        let overrides = PathOverrides {
            project_root: Some(root.to_path_buf()),
            ..PathOverrides::default()
        };
        resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve")
    }

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-root");
        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: temp.path().join("cwd"),
        };
        let env = HashMap::from([(
            "WIKIMOVE_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.config_path, from_flag.join(".wikimove").join("config.toml"));
        assert_eq!(resolved.config_source, ValueSource::Default);
        assert!(resolved.diagnostics().contains("project_root="));
        assert!(resolved.diagnostics().contains("(flag)"));
    }

    #[test]
    fn env_overrides_data_dir_and_config_relative_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let env = HashMap::from([
            ("WIKIMOVE_PROJECT_ROOT".to_string(), root.to_string_lossy().to_string()),
            ("WIKIMOVE_DATA_DIR".to_string(), "cache/data".to_string()),
            ("WIKIMOVE_CONFIG".to_string(), "  ".to_string()),
        ]);

        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| env.get(key).cloned())
                .expect("resolve");
        assert_eq!(resolved.root_source, ValueSource::Env);
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.data_dir, root.join("cache").join("data"));
        assert_eq!(resolved.db_path, root.join("cache").join("data").join("wikimove.db"));
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn project_root_is_discovered_from_an_initialized_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("jobs").join("drafts");
        fs::create_dir_all(root.join(".wikimove")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let context = ResolutionContext { cwd: nested };
        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None).expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Discovered);
    }

    #[test]
    fn init_layout_writes_loadable_config_and_job() {
        let temp = tempdir().expect("tempdir");
        let paths = rooted_at(&temp.path().join("project"));

        let report = init_layout(&paths, &InitOptions::default()).expect("init");

        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config && report.wrote_sample_job);
        assert!(paths.wiki_content_dir.exists());
        assert!(paths.state_dir.join("runs").exists());
        assert!(paths.data_dir.exists());
        let config = load_config(&paths.config_path).expect("config");
        assert_eq!(config.engine.deletion_categories, vec!["Candidates for deletion"]);
        let job = JobFile::load(&paths.jobs_dir.join(SAMPLE_JOB_FILENAME)).expect("job");
        assert_eq!(job.kind, "move-pages");

        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
        let status = RuntimeStatus::inspect(&paths);
        assert!(status.warnings.is_empty());
        status.require_local_mirror(&paths).expect("ready");
    }

    #[test]
    fn local_mirror_readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(root.join("wiki_content")).expect("content dir");
        let paths = rooted_at(&root);

        let status = RuntimeStatus::inspect(&paths);
        assert_eq!(status.warnings.len(), 2);
        let err = status.require_local_mirror(&paths).expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("Local mirror is not initialized"));
        assert!(message.contains(".wikimove/"));
        assert!(!message.contains("wiki_content/"));
    }
}
