use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitflags::bitflags;
use tracing::{info, warn};

use crate::backlinks::{BatchOptions, BatchReport, PageEdit, RunSignals, process_in_chunks};
use crate::error::{ConfigurationError, Issue, IssueKind};
use crate::registry::{ActionKind, ReplacementRegistry};
use crate::rewrite::{LinkRewriter, RewriteOptions, reconcile_captions};
use crate::site::{BacklinkKind, PurgeMethod, WikiWrite};
use crate::title::{NamespaceTable, Title};
use crate::wikitext;

bitflags! {
    /// Post-passes and visitor toggles applied after the primary rewrite.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FollowUpActions: u8 {
        const EMIT_REPORT = 1;
        const FIX_LINKS = 1 << 1;
        const FIX_CAPTION = 1 << 2;
        const UPDATE_CATEGORY_MEMBERS = 1 << 3;
        /// Visitor toggle: report references still pointing at a source.
        const CHECK_LINKS_REMAINING = 1 << 4;
        /// Visitor toggle: keep the visible text of every rewritten link.
        const RETAIN_DIRECT_LINK_TEXT = 1 << 5;
    }
}

impl FollowUpActions {
    const NAMES: [(&'static str, Self); 6] = [
        ("emit-report", Self::EMIT_REPORT),
        ("fix-links", Self::FIX_LINKS),
        ("fix-caption", Self::FIX_CAPTION),
        ("update-category-members", Self::UPDATE_CATEGORY_MEMBERS),
        ("check-links-remaining", Self::CHECK_LINKS_REMAINING),
        ("retain-direct-link-text", Self::RETAIN_DIRECT_LINK_TEXT),
    ];

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::NAMES
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, flag)| *flag)
    }

    pub fn from_names<I, S>(names: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut flags = Self::empty();
        for name in names {
            let name = name.as_ref();
            let flag = Self::parse(name).ok_or_else(|| {
                ConfigurationError::InvalidJob(format!("unknown follow-up action {name:?}"))
            })?;
            flags.insert(flag);
        }
        Ok(flags)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect()
    }

    pub fn rewrite_options(self) -> RewriteOptions {
        RewriteOptions {
            retain_direct_link_text: self.contains(Self::RETAIN_DIRECT_LINK_TEXT),
            check_links_remaining: self.contains(Self::CHECK_LINKS_REMAINING),
        }
    }
}

impl Default for FollowUpActions {
    fn default() -> Self {
        Self::FIX_LINKS | Self::EMIT_REPORT | Self::RETAIN_DIRECT_LINK_TEXT
    }
}

impl fmt::Display for FollowUpActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&self.names().join("|"))
    }
}

/// Settings shared by every page-saving pass of a run.
#[derive(Debug, Clone, Copy)]
pub struct PassSettings<'a> {
    pub namespaces: &'a NamespaceTable,
    pub batch: BatchOptions,
    pub summary: &'a str,
    pub minor: bool,
    pub signals: &'a RunSignals,
}

/// Sorted, deduplicated listing of every replacement and its resolved outcome,
/// followed by the accumulated issues.
pub fn render_report(
    registry: &ReplacementRegistry,
    moved: &BTreeSet<Title>,
    issues: &[Issue],
) -> String {
    let mut lines = BTreeSet::new();
    for entry in registry.values() {
        let mut line = format!(
            "{} -> {}\t{}\t{}",
            entry.from,
            entry.to,
            entry.action.map_or("unresolved", ActionKind::as_str),
            entry.reason.as_deref().unwrap_or_default()
        );
        if let Some(requested) = entry.requested
            && Some(requested) != entry.action
        {
            line.push_str(&format!(" (requested {})", requested.as_str()));
        }
        if moved.contains(&entry.from) {
            line.push_str("\tmoved");
        }
        lines.insert(line);
    }

    let mut out = String::new();
    out.push_str(&format!("replacements: {}\n", lines.len()));
    for line in &lines {
        out.push_str(line);
        out.push('\n');
    }

    let issues: BTreeSet<&Issue> = issues.iter().collect();
    out.push_str(&format!("issues: {}\n", issues.len()));
    for issue in issues {
        out.push_str(&issue.to_string());
        out.push('\n');
    }
    out
}

/// Rewrites captions that repeated an old file name on pages using the renamed file.
pub fn fix_captions<S: WikiWrite + ?Sized>(
    site: &mut S,
    registry: &ReplacementRegistry,
    settings: &PassSettings<'_>,
) -> BatchReport {
    let renamed: BTreeMap<Title, Title> = registry
        .values()
        .filter(|entry| !entry.is_skipped() && entry.from.is_file() && entry.to.is_file())
        .map(|entry| (entry.to.without_fragment(), entry.from.without_fragment()))
        .collect();
    if renamed.is_empty() {
        return BatchReport::default();
    }

    let mut issues = Vec::new();
    let mut pages = BTreeSet::new();
    for new in renamed.keys() {
        match site.backlinks(new, &[BacklinkKind::FileUsage]) {
            Ok(found) => pages.extend(found),
            Err(error) => {
                warn!(file = %new, %error, "file usage lookup failed");
                issues.push(Issue::new(
                    IssueKind::CollaboratorError,
                    new.to_string(),
                    format!("file usage lookup failed: {error}"),
                ));
            }
        }
    }
    let pages: Vec<Title> = pages.into_iter().collect();
    info!(files = renamed.len(), pages = pages.len(), "reconciling file captions");

    let mut report = process_in_chunks(
        site,
        &pages,
        &settings.batch,
        settings.signals,
        |page| {
            let mut nodes = wikitext::parse(&page.text);
            let changes = reconcile_captions(&mut nodes, &renamed, settings.namespaces);
            if changes.is_empty() {
                return Ok(PageEdit::Unchanged);
            }
            page.text = wikitext::render(&nodes);
            Ok(PageEdit::Save {
                summary: settings.summary.to_string(),
                minor: settings.minor,
            })
        },
        |_, _| {},
    );
    report.issues.extend(issues);
    report
}

/// Re-tags members of categories that are themselves being replaced.
pub fn update_category_members<S: WikiWrite + ?Sized>(
    site: &mut S,
    registry: &ReplacementRegistry,
    settings: &PassSettings<'_>,
) -> BatchReport {
    let categories: BTreeMap<Title, Title> = registry
        .values()
        .filter(|entry| !entry.is_skipped() && entry.from.is_category() && entry.to.is_category())
        .map(|entry| (entry.from.without_fragment(), entry.to.without_fragment()))
        .collect();
    if categories.is_empty() {
        return BatchReport::default();
    }

    let mut issues = Vec::new();
    let mut members = BTreeSet::new();
    for category in categories.keys() {
        match site.category_members(category) {
            Ok(found) => members.extend(found),
            Err(error) => {
                warn!(category = %category, %error, "category member lookup failed");
                issues.push(Issue::new(
                    IssueKind::CollaboratorError,
                    category.to_string(),
                    format!("category member lookup failed: {error}"),
                ));
            }
        }
    }
    let members: Vec<Title> = members.into_iter().collect();
    info!(categories = categories.len(), pages = members.len(), "re-tagging category members");

    let rewriter = LinkRewriter::new(&categories, settings.namespaces);
    let mut report = process_in_chunks(
        site,
        &members,
        &settings.batch,
        settings.signals,
        |page| {
            let (text, outcome) = rewriter.rewrite_text(&page.title, &page.text);
            if !outcome.changed() {
                return Ok(PageEdit::Unchanged);
            }
            page.text = text;
            Ok(PageEdit::Save {
                summary: settings.summary.to_string(),
                minor: settings.minor,
            })
        },
        |_, _| {},
    );

    // Category pages only list their new members after a links update.
    if !settings.batch.dry_run && !report.cancelled && report.count("saved") > 0 {
        let renamed: Vec<Title> = categories.values().cloned().collect();
        if let Err(error) = site.purge(&renamed, PurgeMethod::ForceLinkUpdate) {
            warn!(%error, "category purge failed");
            issues.push(Issue::new(
                IssueKind::CollaboratorError,
                renamed
                    .iter()
                    .map(Title::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
                format!("purge failed: {error}"),
            ));
        }
    }
    report.issues.extend(issues);
    report
}
