use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backlinks::DiscoveryOptions;
use crate::engine::{AppendMerge, MergeHandler};
use crate::error::ConfigurationError;
use crate::followup::FollowUpActions;
use crate::registry::{ActionKind, ReplacementRegistry};
use crate::resolver::{ConflictPolicy, DefaultPolicy, ForceAction};
use crate::rewrite::{NamespacedTitleParameter, TemplateRules, TitleListParameter, TitleParameter};
use crate::title::{NS_MAIN, NS_TEMPLATE, NamespaceTable, Title};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    MovePages,
    MergeNamespace,
    FixLinks,
    FixDoubleRedirects,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MovePages => "move-pages",
            Self::MergeNamespace => "merge-namespace",
            Self::FixLinks => "fix-links",
            Self::FixDoubleRedirects => "fix-double-redirects",
        }
    }
}

/// One entry of the static job registry.
pub struct JobDescriptor {
    pub id: &'static str,
    pub kind: JobKind,
    pub description: &'static str,
    pub build: fn(JobFile, &NamespaceTable) -> Result<Job, ConfigurationError>,
}

pub static JOB_REGISTRY: &[JobDescriptor] = &[
    JobDescriptor {
        id: "move-pages",
        kind: JobKind::MovePages,
        description: "Move pages and retarget every reference to them",
        build: build_move_pages,
    },
    JobDescriptor {
        id: "merge-namespace",
        kind: JobKind::MergeNamespace,
        description: "Merge listed pages of one namespace into another",
        build: build_merge_namespace,
    },
    JobDescriptor {
        id: "fix-links",
        kind: JobKind::FixLinks,
        description: "Retarget references to pages that were already moved",
        build: build_fix_links,
    },
    JobDescriptor {
        id: "fix-double-redirects",
        kind: JobKind::FixDoubleRedirects,
        description: "Point redirects to redirects at the end of the chain",
        build: build_fix_double_redirects,
    },
];

pub fn find_job(id: &str) -> Option<&'static JobDescriptor> {
    JOB_REGISTRY.iter().find(|descriptor| descriptor.id == id.trim())
}

/// A configured job ready for the engine.
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub registry: ReplacementRegistry,
    pub policy: Box<dyn ConflictPolicy>,
    pub merge_handler: Option<Box<dyn MergeHandler>>,
    pub rules: TemplateRules,
    pub follow_ups: FollowUpActions,
    pub discovery: DiscoveryOptions,
    pub summary: Option<String>,
    pub minor: Option<bool>,
    /// Namespaces scanned by `fix-double-redirects`; empty means the configured default.
    pub redirect_namespaces: Vec<i32>,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: JobKind, registry: ReplacementRegistry) -> Self {
        Self {
            id: id.into(),
            kind,
            registry,
            policy: Box::new(DefaultPolicy),
            merge_handler: None,
            rules: TemplateRules::new(),
            follow_ups: FollowUpActions::default(),
            discovery: DiscoveryOptions::default(),
            summary: None,
            minor: None,
            redirect_namespaces: Vec::new(),
        }
    }
}

/// On-disk job definition (`job.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    pub kind: String,
    pub id: Option<String>,
    pub summary: Option<String>,
    pub minor: Option<bool>,
    pub follow_ups: Option<Vec<String>>,
    /// Forces one action for every replacement whose source exists.
    pub action: Option<String>,
    #[serde(default)]
    pub include_category_members: bool,
    pub follow_redirects: Option<bool>,
    #[serde(default)]
    pub replacements: Vec<ReplacementSpec>,
    #[serde(default)]
    pub templates: Vec<TemplateRuleSpec>,
    pub from_namespace: Option<String>,
    pub to_namespace: Option<String>,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplacementSpec {
    pub from: String,
    pub to: String,
    pub action: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRuleSpec {
    pub template: String,
    #[serde(flatten)]
    pub handler: HandlerSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "handler", rename_all = "kebab-case")]
pub enum HandlerSpec {
    Title {
        parameter: String,
        namespace: Option<String>,
        max_positional: Option<usize>,
    },
    NamespacedTitle {
        namespace_parameter: String,
        page_parameter: String,
        namespace: Option<String>,
    },
    TitleList {
        parameter: String,
        #[serde(default = "default_separator")]
        separator: String,
        namespace: Option<String>,
    },
}

fn default_separator() -> String {
    ",".to_string()
}

impl JobFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse job definition")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid job file {}", path.display()))
    }
}

/// Loads a job file and builds it through the registry. The job id defaults
/// to the file stem.
pub fn load_job(path: &Path, namespaces: &NamespaceTable) -> Result<Job> {
    let mut file = JobFile::load(path)?;
    if file.id.is_none() {
        file.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
    }
    Ok(build_job(file, namespaces)?)
}

pub fn build_job(file: JobFile, namespaces: &NamespaceTable) -> Result<Job, ConfigurationError> {
    let descriptor =
        find_job(&file.kind).ok_or_else(|| ConfigurationError::UnknownJob(file.kind.clone()))?;
    (descriptor.build)(file, namespaces)
}

fn build_move_pages(file: JobFile, namespaces: &NamespaceTable) -> Result<Job, ConfigurationError> {
    let job = build_common(&file, JobKind::MovePages, namespaces)?;
    if job.registry.is_empty() {
        return Err(ConfigurationError::InvalidJob(
            "move-pages needs at least one [[replacements]] entry".to_string(),
        ));
    }
    Ok(job)
}

fn build_merge_namespace(
    file: JobFile,
    namespaces: &NamespaceTable,
) -> Result<Job, ConfigurationError> {
    let (Some(from), Some(to)) = (&file.from_namespace, &file.to_namespace) else {
        return Err(ConfigurationError::InvalidJob(
            "merge-namespace needs from_namespace and to_namespace".to_string(),
        ));
    };
    let from = namespace_id(from, namespaces)?;
    let to = namespace_id(to, namespaces)?;
    if from == to {
        return Err(ConfigurationError::InvalidJob(
            "merge-namespace source and destination namespaces are the same".to_string(),
        ));
    }

    let mut job = build_common(&file, JobKind::MergeNamespace, namespaces)?;
    for page in &file.pages {
        let source = Title::new(from, page, namespaces)
            .map_err(|source| ConfigurationError::malformed_title(page, source))?;
        let destination = Title::new(to, page, namespaces)
            .map_err(|source| ConfigurationError::malformed_title(page, source))?;
        job.registry.add(source, destination, None, None)?;
    }
    if job.registry.is_empty() {
        return Err(ConfigurationError::InvalidJob(
            "merge-namespace lists no pages".to_string(),
        ));
    }
    job.merge_handler = Some(Box::new(AppendMerge));
    Ok(job)
}

fn build_fix_links(file: JobFile, namespaces: &NamespaceTable) -> Result<Job, ConfigurationError> {
    if file.action.is_some() {
        return Err(ConfigurationError::InvalidJob(
            "fix-links never moves pages; remove the action key".to_string(),
        ));
    }
    let mut job = build_common(&file, JobKind::FixLinks, namespaces)?;
    job.policy = Box::new(ForceAction {
        action: ActionKind::EditOnly,
        reason: "page already moved; references retargeted only".to_string(),
    });
    Ok(job)
}

fn build_fix_double_redirects(
    file: JobFile,
    namespaces: &NamespaceTable,
) -> Result<Job, ConfigurationError> {
    if !file.replacements.is_empty() {
        return Err(ConfigurationError::InvalidJob(
            "fix-double-redirects takes no replacements".to_string(),
        ));
    }
    let mut job = build_common(&file, JobKind::FixDoubleRedirects, namespaces)?;
    job.redirect_namespaces = file
        .namespaces
        .iter()
        .map(|name| namespace_id(name, namespaces))
        .collect::<Result<_, _>>()?;
    Ok(job)
}

fn build_common(
    file: &JobFile,
    kind: JobKind,
    namespaces: &NamespaceTable,
) -> Result<Job, ConfigurationError> {
    let id = file
        .id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| kind.as_str().to_string());

    let mut registry = ReplacementRegistry::new();
    for spec in &file.replacements {
        let from = parse_title(&spec.from, namespaces)?;
        let to = parse_title(&spec.to, namespaces)?;
        let action = spec.action.as_deref().map(parse_action).transpose()?;
        registry.add(from, to, action, spec.reason.clone())?;
    }

    let mut job = Job::new(id, kind, registry);
    if let Some(action) = file.action.as_deref() {
        let action = parse_action(action)?;
        job.policy = Box::new(ForceAction {
            action,
            reason: format!("{} forced by job", action.as_str()),
        });
    }
    if let Some(names) = &file.follow_ups {
        job.follow_ups = FollowUpActions::from_names(names)?;
    }
    job.discovery = DiscoveryOptions {
        include_category_members: file.include_category_members,
        follow_redirects: file.follow_redirects.unwrap_or(true),
    };
    job.summary = file.summary.clone();
    job.minor = file.minor;
    job.rules = template_rules(&file.templates, namespaces)?;
    Ok(job)
}

fn template_rules(
    specs: &[TemplateRuleSpec],
    namespaces: &NamespaceTable,
) -> Result<TemplateRules, ConfigurationError> {
    let mut rules = TemplateRules::new();
    for spec in specs {
        let template = Title::parse_with_default(&spec.template, NS_TEMPLATE, namespaces)
            .map_err(|source| ConfigurationError::malformed_title(&spec.template, source))?;
        let default_namespace = |namespace: &Option<String>| {
            namespace
                .as_deref()
                .map_or(Ok(NS_MAIN), |name| namespace_id(name, namespaces))
        };
        let handler: Box<dyn crate::rewrite::RewriteHandler> = match &spec.handler {
            HandlerSpec::Title {
                parameter,
                namespace,
                max_positional,
            } => Box::new(TitleParameter {
                parameter: parameter.clone(),
                default_namespace: default_namespace(namespace)?,
                max_positional: *max_positional,
            }),
            HandlerSpec::NamespacedTitle {
                namespace_parameter,
                page_parameter,
                namespace,
            } => Box::new(NamespacedTitleParameter {
                namespace_parameter: namespace_parameter.clone(),
                page_parameter: page_parameter.clone(),
                default_namespace: default_namespace(namespace)?,
            }),
            HandlerSpec::TitleList {
                parameter,
                separator,
                namespace,
            } => Box::new(TitleListParameter {
                parameter: parameter.clone(),
                separator: separator.clone(),
                default_namespace: default_namespace(namespace)?,
            }),
        };
        rules.register(template, handler)?;
    }
    Ok(rules)
}

fn parse_title(value: &str, namespaces: &NamespaceTable) -> Result<Title, ConfigurationError> {
    Title::parse(value, namespaces).map_err(|source| ConfigurationError::malformed_title(value, source))
}

fn parse_action(value: &str) -> Result<ActionKind, ConfigurationError> {
    ActionKind::parse(value)
        .ok_or_else(|| ConfigurationError::InvalidJob(format!("unknown action {value:?}")))
}

/// Namespace by name, alias or number. `Main` and the empty string are namespace 0.
pub fn namespace_id(value: &str, namespaces: &NamespaceTable) -> Result<i32, ConfigurationError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("main") || value == "(main)" {
        return Ok(NS_MAIN);
    }
    if let Ok(id) = value.parse::<i32>() {
        return namespaces
            .get(id)
            .map(|_| id)
            .ok_or_else(|| ConfigurationError::InvalidJob(format!("unknown namespace id {id}")));
    }
    namespaces
        .lookup(value)
        .ok_or_else(|| ConfigurationError::InvalidJob(format!("unknown namespace {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::title;

    fn build(text: &str) -> Result<Job, ConfigurationError> {
        build_job(JobFile::parse(text).expect("parse"), &NamespaceTable::standard())
    }

    #[test]
    fn registry_lists_every_job_kind() {
        let ids: Vec<&str> = JOB_REGISTRY.iter().map(|descriptor| descriptor.id).collect();
        assert_eq!(
            ids,
            vec!["move-pages", "merge-namespace", "fix-links", "fix-double-redirects"]
        );
        for descriptor in JOB_REGISTRY {
            assert_eq!(descriptor.kind.as_str(), descriptor.id);
        }
    }

    #[test]
    fn move_pages_job_reads_replacements_and_rules() {
        let job = build(
            r#"
kind = "move-pages"
id = "lore-cleanup"
summary = "Lore cleanup"
follow_ups = ["fix-links", "fix-caption", "emit-report"]

[[replacements]]
from = "Old Page"
to = "Help:New Page"
reason = "consolidating help"

[[replacements]]
from = "Sandbox"
to = "Project:Sandbox"
action = "edit-only"

[[templates]]
template = "Main"
handler = "title"
parameter = "1"
max_positional = 3

[[templates]]
template = "See also"
handler = "title-list"
parameter = "1"
separator = ";"
"#,
        )
        .expect("job");

        assert_eq!(job.id, "lore-cleanup");
        assert_eq!(job.kind, JobKind::MovePages);
        assert_eq!(job.registry.len(), 2);
        let sandbox = job.registry.get(&title("Sandbox")).expect("entry");
        assert_eq!(sandbox.requested, Some(ActionKind::EditOnly));
        assert_eq!(
            job.registry.get(&title("Old Page")).and_then(|entry| entry.reason.as_deref()),
            Some("consolidating help")
        );
        assert!(job.follow_ups.contains(FollowUpActions::FIX_CAPTION));
        assert!(!job.follow_ups.contains(FollowUpActions::RETAIN_DIRECT_LINK_TEXT));
        assert_eq!(job.rules.templates().count(), 2);
        assert_eq!(job.summary.as_deref(), Some("Lore cleanup"));
    }

    #[test]
    fn unknown_kind_and_bad_input_are_configuration_errors() {
        assert!(matches!(
            build("kind = \"rename-everything\""),
            Err(ConfigurationError::UnknownJob(_))
        ));
        assert!(matches!(
            build("kind = \"move-pages\""),
            Err(ConfigurationError::InvalidJob(_))
        ));
        assert!(matches!(
            build(
                "kind = \"move-pages\"\n[[replacements]]\nfrom = \"A\"\nto = \"B\"\n\
                 [[replacements]]\nfrom = \"A\"\nto = \"C\"\n"
            ),
            Err(ConfigurationError::DuplicateSource { .. })
        ));
        assert!(matches!(
            build("kind = \"move-pages\"\n[[replacements]]\nfrom = \"A[1]\"\nto = \"B\"\n"),
            Err(ConfigurationError::MalformedTitle { .. })
        ));
        assert!(matches!(
            build(
                "kind = \"move-pages\"\nfollow_ups = [\"polish\"]\n\
                 [[replacements]]\nfrom = \"A\"\nto = \"B\"\n"
            ),
            Err(ConfigurationError::InvalidJob(_))
        ));
    }

    #[test]
    fn handler_collisions_fail_at_build_time() {
        let result = build(
            r#"
kind = "fix-links"

[[replacements]]
from = "A"
to = "B"

[[templates]]
template = "Main"
handler = "title"
parameter = "1"

[[templates]]
template = "Template:Main"
handler = "title-list"
parameter = "1"
"#,
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::HandlerCollision { .. })
        ));
    }

    #[test]
    fn merge_namespace_maps_listed_pages() {
        let job = build(
            r#"
kind = "merge-namespace"
from_namespace = "Help"
to_namespace = "Project"
pages = ["Editing", "Style guide"]
"#,
        )
        .expect("job");
        assert!(job.merge_handler.is_some());
        assert_eq!(
            job.registry.get(&title("Help:Style guide")).map(|entry| entry.to.clone()),
            Some(title("Project:Style guide"))
        );
        assert!(matches!(
            build("kind = \"merge-namespace\"\nfrom_namespace = \"Help\"\nto_namespace = \"Help\"\npages = [\"A\"]\n"),
            Err(ConfigurationError::InvalidJob(_))
        ));
    }

    #[test]
    fn fix_double_redirects_reads_namespaces() {
        let job = build("kind = \"fix-double-redirects\"\nnamespaces = [\"Main\", \"Help\", \"4\"]\n")
            .expect("job");
        assert_eq!(job.redirect_namespaces, vec![0, 12, 4]);
        assert!(job.registry.is_empty());
    }

    #[test]
    fn load_job_defaults_id_to_file_stem() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("spring-moves.toml");
        fs::write(
            &path,
            "kind = \"move-pages\"\n[[replacements]]\nfrom = \"A\"\nto = \"B\"\n",
        )
        .expect("write");
        let job = load_job(&path, &NamespaceTable::standard()).expect("job");
        assert_eq!(job.id, "spring-moves");
    }
}
