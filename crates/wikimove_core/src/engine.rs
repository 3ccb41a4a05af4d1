use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::backlinks::{
    BatchOptions, BatchReport, PageEdit, RunSignals, clamp_chunk_size, discover_backlinks,
    process_in_chunks,
};
use crate::config::WikiConfig;
use crate::error::{Cancelled, ConfigurationError, Issue, IssueKind, SiteError, SiteResult};
use crate::followup::{self, FollowUpActions, PassSettings};
use crate::jobs::Job;
use crate::redirects::{ChainOutcome, RedirectEdge, RedirectTable, expand_destinations, resolve_chains};
use crate::registry::{ActionKind, Replacement, ReplacementRegistry, TitleMap};
use crate::resolver::{ConflictResolver, PageStatus, StatusRules};
use crate::rewrite::{LinkRewriter, PageReference, ReferenceKind, RewriteOutcome, retarget_redirect};
use crate::site::{MoveOptions, PageInfo, WikiRead, WikiWrite};
use crate::state::RunState;
use crate::title::{NS_CATEGORY, NS_FILE, NamespaceTable, Title};
use crate::wikitext;

/// Redirect hops followed while collecting page state before giving up.
const MAX_REDIRECT_HOPS: usize = 16;

/// Performs a `CustomMove`: anything beyond a plain page move, such as merging
/// the source into an existing destination.
pub trait MergeHandler {
    fn name(&self) -> &str;
    fn merge(
        &self,
        site: &mut dyn WikiWrite,
        replacement: &Replacement,
        options: &MoveOptions,
    ) -> SiteResult<()>;
}

/// Appends the source text to an existing destination and leaves a redirect
/// behind. A missing destination gets a plain move.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendMerge;

impl MergeHandler for AppendMerge {
    fn name(&self) -> &str {
        "append-merge"
    }

    fn merge(
        &self,
        site: &mut dyn WikiWrite,
        replacement: &Replacement,
        options: &MoveOptions,
    ) -> SiteResult<()> {
        let to = replacement.to.without_fragment();
        let mut loaded = site
            .load_pages(&[replacement.from.clone(), to.clone()])?
            .into_iter();
        let (Some(mut source), Some(mut destination)) = (loaded.next(), loaded.next()) else {
            return Err(SiteError::Other(anyhow!(
                "expected both {} and {to} from the page load",
                replacement.from
            )));
        };
        if !source.exists {
            return Err(SiteError::MissingPage {
                title: source.title.full_name(),
            });
        }
        if !destination.exists {
            return site.move_page(&replacement.from, &to, options);
        }

        let body = source.text.trim();
        if !body.is_empty() && !destination.text.contains(body) {
            if !destination.text.is_empty() && !destination.text.ends_with('\n') {
                destination.text.push('\n');
            }
            destination.text.push('\n');
            destination.text.push_str(body);
            destination.text.push('\n');
            site.save_page(&destination, &options.reason, false)?;
        }
        source.text = redirect_text(&to);
        site.save_page(&source, &options.reason, false)
    }
}

fn redirect_text(target: &Title) -> String {
    let colon = if matches!(target.namespace(), NS_CATEGORY | NS_FILE) && !target.is_interwiki() {
        ":"
    } else {
        ""
    };
    format!("#REDIRECT [[{colon}{target}]]\n")
}

/// Site-wide settings shared by every job run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch: BatchOptions,
    pub summary: String,
    pub minor: bool,
    pub move_options: MoveOptions,
    pub status_rules: StatusRules,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch: BatchOptions::default(),
            summary: crate::config::DEFAULT_EDIT_SUMMARY.to_string(),
            minor: true,
            move_options: MoveOptions::default(),
            status_rules: StatusRules::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(
        config: &WikiConfig,
        namespaces: &NamespaceTable,
    ) -> Result<Self, ConfigurationError> {
        let engine = &config.engine;
        Ok(Self {
            batch: BatchOptions {
                chunk_size: clamp_chunk_size(engine.chunk_size),
                max_save_retries: engine.max_save_retries.max(1),
                dry_run: false,
            },
            summary: engine.edit_summary.clone(),
            minor: engine.minor_edits,
            move_options: MoveOptions {
                reason: engine.edit_summary.clone(),
                leave_redirect: engine.leave_redirects,
                move_talk: engine.move_talk_pages,
                move_subpages: false,
            },
            status_rules: StatusRules {
                deletion_categories: config.deletion_categories(namespaces)?,
                disambiguation_categories: config.disambiguation_categories(namespaces)?,
            },
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.batch.dry_run = dry_run;
        self
    }
}

/// Resolved replacements of a job, before anything is written.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub registry: ReplacementRegistry,
    pub statuses: BTreeMap<Title, PageStatus>,
    pub redirects: RedirectTable,
    pub issues: Vec<Issue>,
}

impl Plan {
    pub fn count(&self, action: ActionKind) -> usize {
        self.registry
            .values()
            .filter(|entry| entry.action == Some(action))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub job_id: String,
    pub dry_run: bool,
    pub registry: ReplacementRegistry,
    pub moved: BTreeSet<Title>,
    pub rewrite: BatchReport,
    pub follow_ups: Vec<(&'static str, BatchReport)>,
    pub issues: Vec<Issue>,
    /// Unified diffs of the pages a dry run would have saved.
    pub diffs: Vec<(Title, String)>,
    pub report: Option<String>,
    pub report_path: Option<PathBuf>,
    pub cancelled: bool,
    pub requests: usize,
}

impl RunReport {
    /// Every issue raised by the run, including per-page failures.
    pub fn all_issues(&self) -> Vec<Issue> {
        let mut issues: BTreeSet<Issue> = self.issues.iter().cloned().collect();
        issues.extend(self.rewrite.issues.iter().cloned());
        for (_, report) in &self.follow_ups {
            issues.extend(report.issues.iter().cloned());
        }
        issues.into_iter().collect()
    }
}

#[derive(Debug, Default)]
pub struct RedirectFixReport {
    pub scanned: usize,
    pub double_redirects: usize,
    pub batch: BatchReport,
    pub issues: Vec<Issue>,
    pub diffs: Vec<(Title, String)>,
    pub requests: usize,
}

/// Runs jobs against a site: plan, physical moves, backlink discovery,
/// rewrite and follow-ups.
pub struct MoveEngine<'a> {
    namespaces: &'a NamespaceTable,
    settings: EngineSettings,
    signals: RunSignals,
}

impl<'a> MoveEngine<'a> {
    pub fn new(namespaces: &'a NamespaceTable, settings: EngineSettings) -> Self {
        Self {
            namespaces,
            settings,
            signals: RunSignals::new(),
        }
    }

    pub fn with_signals(mut self, signals: RunSignals) -> Self {
        self.signals = signals;
        self
    }

    pub fn signals(&self) -> &RunSignals {
        &self.signals
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Resolves the job's replacements against the current site state.
    pub fn plan<S: WikiRead + ?Sized>(&self, site: &mut S, job: &Job) -> Result<Plan> {
        let mut registry = job.registry.clone();
        for (destination, sources) in registry.destination_collisions() {
            let sources: Vec<String> = sources.iter().map(Title::to_string).collect();
            warn!(%destination, sources = %sources.join(", "), "destination claimed by several sources");
        }

        let seeds = registry
            .values()
            .flat_map(|entry| [entry.from.clone(), entry.to.clone()]);
        let (infos, redirects) = self.collect_page_info(site, seeds)?;
        let statuses: BTreeMap<Title, PageStatus> = infos
            .iter()
            .map(|(title, info)| {
                (
                    title.clone(),
                    PageStatus::from_info(info, &self.settings.status_rules),
                )
            })
            .collect();

        ConflictResolver::new(job.policy.as_ref())
            .with_merge_handler(job.merge_handler.is_some())
            .resolve(&mut registry, &statuses);
        let mut issues = expand_destinations(&mut registry, &redirects);
        issues.extend(registry.flatten_chains());

        info!(
            job = %job.id,
            replacements = registry.len(),
            redirects = redirects.len(),
            issues = issues.len(),
            "planned job"
        );
        Ok(Plan {
            registry,
            statuses,
            redirects,
            issues,
        })
    }

    /// Runs a job to completion or until cancelled. Progress goes to `state`
    /// so an interrupted run can be resumed; a dry run writes nothing.
    pub fn run(&self, site: &mut dyn WikiWrite, job: &Job, state: &mut RunState) -> Result<RunReport> {
        let dry_run = self.settings.batch.dry_run;
        let plan = self.plan(site, job)?;
        let mut report = RunReport {
            job_id: job.id.clone(),
            dry_run,
            issues: plan.issues,
            ..RunReport::default()
        };
        let mut registry = plan.registry;
        restore_recorded_moves(&mut registry, state);

        self.apply_moves(site, job, &mut registry, state, &mut report)?;
        if !report.cancelled && !dry_run {
            for entry in registry.values().filter(|entry| !entry.is_physical()) {
                state.record_replacement(entry, false)?;
            }
        }

        let summary = job.summary.as_deref().unwrap_or(&self.settings.summary);
        let minor = job.minor.unwrap_or(self.settings.minor);
        if !report.cancelled && job.follow_ups.contains(FollowUpActions::FIX_LINKS) {
            self.rewrite_backlinks(site, job, &registry, state, summary, minor, &mut report)?;
        }

        if !report.cancelled {
            let settings = PassSettings {
                namespaces: self.namespaces,
                batch: self.settings.batch,
                summary,
                minor,
                signals: &self.signals,
            };
            if job.follow_ups.contains(FollowUpActions::FIX_CAPTION) {
                let pass = followup::fix_captions(site, &registry, &settings);
                report.cancelled |= pass.cancelled;
                report.follow_ups.push(("fix-caption", pass));
            }
            if !report.cancelled && job.follow_ups.contains(FollowUpActions::UPDATE_CATEGORY_MEMBERS) {
                let pass = followup::update_category_members(site, &registry, &settings);
                report.cancelled |= pass.cancelled;
                report.follow_ups.push(("update-category-members", pass));
            }
        }

        if job.follow_ups.contains(FollowUpActions::EMIT_REPORT) {
            let text = followup::render_report(&registry, &report.moved, &report.all_issues());
            if !dry_run {
                report.report_path = Some(state.write_report(&text)?);
            }
            report.report = Some(text);
        }

        report.registry = registry;
        report.requests = site.request_count();
        info!(
            job = %job.id,
            moved = report.moved.len(),
            saved = report.rewrite.count("saved"),
            failed = report.rewrite.count("failed"),
            cancelled = report.cancelled,
            requests = report.requests,
            "job finished"
        );
        Ok(report)
    }

    fn apply_moves(
        &self,
        site: &mut dyn WikiWrite,
        job: &Job,
        registry: &mut ReplacementRegistry,
        state: &mut RunState,
        report: &mut RunReport,
    ) -> Result<()> {
        let dry_run = self.settings.batch.dry_run;
        for entry in registry.values_mut().filter(|entry| entry.is_physical()) {
            if state.is_moved(&entry.from) {
                debug!(from = %entry.from, "already moved");
                report.moved.insert(entry.from.clone());
                continue;
            }
            if self.signals.checkpoint().is_err() {
                report.cancelled = true;
                return Ok(());
            }
            if dry_run {
                info!(from = %entry.from, to = %entry.to, "would move page");
                continue;
            }

            let mut options = self.settings.move_options.clone();
            if let Some(reason) = entry.reason.as_deref().filter(|reason| !reason.is_empty()) {
                options.reason = format!("{}: {reason}", self.settings.summary);
            }
            let to = entry.to.without_fragment();
            let result = match (entry.action, job.merge_handler.as_deref()) {
                (Some(ActionKind::CustomMove), Some(handler)) => {
                    debug!(from = %entry.from, %to, handler = handler.name(), "merging page");
                    handler.merge(site, entry, &options)
                }
                _ => site.move_page(&entry.from, &to, &options),
            };
            match result {
                Ok(()) => {
                    info!(from = %entry.from, %to, "moved page");
                    report.moved.insert(entry.from.clone());
                    state.record_replacement(entry, true)?;
                }
                Err(error) => {
                    warn!(from = %entry.from, %to, %error, "move failed");
                    report.issues.push(Issue::new(
                        IssueKind::CollaboratorError,
                        entry.from.to_string(),
                        format!("move to {to} failed: {error}"),
                    ));
                    entry.set_outcome(ActionKind::Skip, format!("move failed: {error}"));
                    state.record_replacement(entry, false)?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrite_backlinks(
        &self,
        site: &mut dyn WikiWrite,
        job: &Job,
        registry: &ReplacementRegistry,
        state: &mut RunState,
        summary: &str,
        minor: bool,
        report: &mut RunReport,
    ) -> Result<()> {
        let dry_run = self.settings.batch.dry_run;
        let sources: Vec<Title> = registry.sources().into_iter().cloned().collect();
        if sources.is_empty() {
            return Ok(());
        }

        let cached = state.load_backlinks(self.namespaces)?;
        let discovered: Vec<Title> = match cached {
            Some(pages) => {
                info!(pages = pages.len(), "using cached backlinks");
                pages
            }
            None => match discover_backlinks(site, &sources, job.discovery, &self.signals) {
                Ok(discovery) => {
                    report.issues.extend(discovery.issues);
                    let pages: Vec<Title> = discovery.pages.into_iter().collect();
                    if !dry_run {
                        state.save_backlinks(&pages)?;
                    }
                    pages
                }
                Err(Cancelled) => {
                    report.cancelled = true;
                    return Ok(());
                }
            },
        };

        let pages = self.pages_to_visit(registry, &report.moved, discovered, state);
        info!(pages = pages.len(), dry_run, "rewriting references");

        let rewriter = LinkRewriter::new(registry, self.namespaces)
            .with_rules(&job.rules)
            .with_options(job.follow_ups.rewrite_options());
        let namespaces = self.namespaces;
        let mut issues = Vec::new();
        let mut diffs = Vec::new();
        let mut failed_marks = Vec::new();

        let batch = process_in_chunks(
            site,
            &pages,
            &self.settings.batch,
            &self.signals,
            |page| {
                let mut nodes = wikitext::parse(&page.text);
                let mut outcome = retarget_redirect_page(&mut nodes, registry, namespaces);
                outcome.merge(rewriter.rewrite_page(&page.title, &mut nodes));
                issues.extend(std::mem::take(&mut outcome.issues));
                if !outcome.changed() {
                    return Ok(PageEdit::Unchanged);
                }
                let text = wikitext::render(&nodes);
                if text == page.text {
                    return Ok(PageEdit::Unchanged);
                }
                debug!(title = %page.title, changes = outcome.changes.len(), "page rewritten");
                if dry_run {
                    diffs.push((page.title.clone(), unified_diff(&page.title, &page.text, &text)));
                }
                page.text = text;
                Ok(PageEdit::Save {
                    summary: summary.to_string(),
                    minor,
                })
            },
            |title, result| {
                if dry_run || !result.is_complete() {
                    return;
                }
                if let Err(error) = state.mark_page_rewritten(title) {
                    warn!(%title, %error, "failed to record progress");
                    failed_marks.push(title.clone());
                }
            },
        );

        for title in failed_marks {
            report.issues.push(Issue::new(
                IssueKind::CollaboratorError,
                title.to_string(),
                "rewritten but progress was not recorded",
            ));
        }
        report.issues.extend(issues);
        report.diffs.extend(diffs);
        report.cancelled |= batch.cancelled;
        report.rewrite = batch;
        Ok(())
    }

    /// Discovered pages, with moved sources replaced by their new titles, plus
    /// the pages whose own text is part of the job. Pages finished by an
    /// earlier attempt are dropped.
    fn pages_to_visit(
        &self,
        registry: &ReplacementRegistry,
        moved: &BTreeSet<Title>,
        discovered: Vec<Title>,
        state: &RunState,
    ) -> Vec<Title> {
        let mut pages = BTreeSet::new();
        for page in discovered {
            let page = match registry.get(&page) {
                Some(entry) if moved.contains(&entry.from) => entry.to.without_fragment(),
                _ => page.without_fragment(),
            };
            pages.insert(page);
        }
        for entry in registry.values().filter(|entry| !entry.is_skipped()) {
            if moved.contains(&entry.from) {
                pages.insert(entry.to.without_fragment());
            } else if entry.action == Some(ActionKind::EditOnly) {
                pages.insert(entry.from.clone());
            }
        }
        pages
            .into_iter()
            .filter(|page| !page.is_interwiki() && !state.is_page_rewritten(page))
            .collect()
    }

    /// Points redirects whose target is itself a redirect at the end of the chain.
    pub fn fix_double_redirects(
        &self,
        site: &mut dyn WikiWrite,
        namespaces: &[i32],
    ) -> Result<RedirectFixReport> {
        let dry_run = self.settings.batch.dry_run;
        let listed = site
            .list_redirects(namespaces)
            .context("failed to list redirects")?;
        let (_, table) = self.collect_page_info(site, listed.iter().cloned())?;
        let starts = table.double_redirects();
        let mut report = RedirectFixReport {
            scanned: listed.len(),
            double_redirects: starts.len(),
            ..RedirectFixReport::default()
        };

        let mut retargets: BTreeMap<Title, (Title, Title)> = BTreeMap::new();
        for outcome in resolve_chains(&starts, &table) {
            if let Some(issue) = outcome.issue() {
                report.issues.push(issue);
            }
            if let ChainOutcome::Retarget {
                from,
                original,
                target,
            } = outcome
            {
                retargets.insert(from, (original, target));
            }
        }
        info!(
            scanned = report.scanned,
            double = report.double_redirects,
            retarget = retargets.len(),
            "resolved redirect chains"
        );

        let pages: Vec<Title> = retargets.keys().cloned().collect();
        let namespace_table = self.namespaces;
        let mut diffs = Vec::new();
        let mut issues = Vec::new();
        let summary = &self.settings.summary;
        let minor = self.settings.minor;
        report.batch = process_in_chunks(
            site,
            &pages,
            &self.settings.batch,
            &self.signals,
            |page| {
                let Some((original, target)) = retargets.get(&page.title) else {
                    return Ok(PageEdit::Unchanged);
                };
                let mut nodes = wikitext::parse(&page.text);
                let current = wikitext::redirect_link(&nodes)
                    .and_then(|link| Title::parse(&link.target, namespace_table).ok());
                if current.as_ref() != Some(original) {
                    issues.push(Issue::new(
                        IssueKind::StructuralMismatch,
                        page.title.to_string(),
                        format!("redirect no longer points at {original}; left unchanged"),
                    ));
                    return Ok(PageEdit::Unchanged);
                }
                if !retarget_redirect(&mut nodes, target) {
                    return Ok(PageEdit::Unchanged);
                }
                let text = wikitext::render(&nodes);
                if dry_run {
                    diffs.push((page.title.clone(), unified_diff(&page.title, &page.text, &text)));
                }
                page.text = text;
                Ok(PageEdit::Save {
                    summary: format!("{summary}: retarget double redirect to {target}"),
                    minor,
                })
            },
            |_, _| {},
        );
        report.issues.extend(issues);
        report.diffs = diffs;
        report.requests = site.request_count();
        Ok(report)
    }

    /// Page info for `seeds` and every redirect target reachable from them.
    fn collect_page_info<S: WikiRead + ?Sized>(
        &self,
        site: &mut S,
        seeds: impl IntoIterator<Item = Title>,
    ) -> Result<(BTreeMap<Title, PageInfo>, RedirectTable)> {
        let chunk_size = clamp_chunk_size(self.settings.batch.chunk_size);
        let mut infos: BTreeMap<Title, PageInfo> = BTreeMap::new();
        let mut table = RedirectTable::new();
        let mut pending: BTreeSet<Title> = seeds
            .into_iter()
            .filter(|title| !title.is_interwiki())
            .map(|title| title.without_fragment())
            .collect();

        for hop in 0..MAX_REDIRECT_HOPS {
            if pending.is_empty() {
                break;
            }
            let round: Vec<Title> = std::mem::take(&mut pending).into_iter().collect();
            debug!(hop, titles = round.len(), "querying page info");
            for chunk in round.chunks(chunk_size) {
                self.signals.checkpoint()?;
                let found = site
                    .page_info(chunk)
                    .with_context(|| format!("failed to query page info for {} titles", chunk.len()))?;
                for info in found {
                    if let Some(target) = &info.redirect_target {
                        table.insert(RedirectEdge::new(info.title.clone(), target.clone()));
                        let next = target.without_fragment();
                        if !next.is_interwiki() && !infos.contains_key(&next) && !round.contains(&next) {
                            pending.insert(next);
                        }
                    }
                    infos.insert(info.title.clone(), info);
                }
            }
        }
        if !pending.is_empty() {
            warn!(remaining = pending.len(), "stopped following redirects");
        }
        Ok((infos, table))
    }
}

/// On resume, entries moved by the earlier attempt keep the outcome recorded
/// then; the site now reports their sources as redirects.
fn restore_recorded_moves(registry: &mut ReplacementRegistry, state: &RunState) {
    for entry in registry.values_mut() {
        if let Some(record) = state.replacement(&entry.from).filter(|record| record.moved) {
            entry.action = record.action;
            entry.reason = record.reason.clone();
        }
    }
}

/// Retargets a redirect page whose target is a mapped source. The old
/// fragment is kept unless the destination has its own.
fn retarget_redirect_page(
    nodes: &mut [wikitext::Node],
    map: &dyn TitleMap,
    namespaces: &NamespaceTable,
) -> RewriteOutcome {
    let mut outcome = RewriteOutcome::default();
    let Some(current) = wikitext::redirect_link(nodes)
        .and_then(|link| Title::parse(&link.target, namespaces).ok())
    else {
        return outcome;
    };
    let Some(new) = map.lookup(&current) else {
        return outcome;
    };
    let new = if new.fragment().is_some() {
        new.clone()
    } else {
        new.with_fragment(current.fragment())
    };
    if retarget_redirect(nodes, &new) {
        outcome
            .changes
            .push(PageReference::new(ReferenceKind::Redirect, current, Some(new)));
    }
    outcome
}

fn unified_diff(title: &Title, before: &str, after: &str) -> String {
    similar::TextDiff::from_lines(before, after)
        .unified_diff()
        .header(&format!("{title} (current)"), &format!("{title} (rewritten)"))
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobKind};
    use crate::testing::{MockSite, title};
    use tempfile::tempdir;

    fn job(pairs: &[(&str, &str)]) -> Job {
        let mut registry = ReplacementRegistry::new();
        for (from, to) in pairs {
            registry
                .add(title(from), title(to), None, None)
                .expect("add replacement");
        }
        Job::new("test-job", JobKind::MovePages, registry)
    }

    fn run(site: &mut MockSite, job: &Job, state: &mut RunState, dry_run: bool) -> RunReport {
        let namespaces = NamespaceTable::standard();
        let engine = MoveEngine::new(&namespaces, EngineSettings::default().with_dry_run(dry_run));
        engine.run(site, job, state).expect("run")
    }

    #[test]
    fn moves_page_and_rewrites_only_referencing_pages() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("P1", "See [[Old:Foo]]."),
            ("P2", "Also [[Old:Foo|the foo]]"),
            ("P3", "Unrelated [[Elsewhere]]"),
        ]);

        let report = run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state, false);

        assert_eq!(site.moved, vec![(title("Old:Foo"), title("New:Foo"))]);
        assert_eq!(site.text("P1"), Some("See [[New:Foo|Old:Foo]]."));
        assert_eq!(site.text("P2"), Some("Also [[New:Foo|the foo]]"));
        assert_eq!(site.saved_titles(), BTreeSet::from([title("P1"), title("P2")]));
        assert!(report.moved.contains(&title("Old:Foo")));
        assert!(state.is_moved(&title("Old:Foo")));
        assert!(state.is_page_rewritten(&title("P1")));

        let text = report.report.expect("report");
        assert!(text.contains("Old:Foo -> New:Foo\tmove\t"));
        assert!(text.ends_with("issues: 0\n"));
        assert!(report.report_path.expect("path").exists());
    }

    #[test]
    fn redirect_destination_is_edit_only_and_expanded() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Old:Bar", "Bar content"),
            ("New:Bar", "#REDIRECT [[Target]]"),
            ("Target", "Target content"),
            ("P1", "[[Old:Bar]]"),
        ]);

        let report = run(&mut site, &job(&[("Old:Bar", "New:Bar")]), &mut state, false);

        let entry = report.registry.get(&title("Old:Bar")).expect("entry");
        assert_eq!(entry.action, Some(ActionKind::EditOnly));
        assert!(entry.reason.as_deref().unwrap_or_default().contains("redirect"));
        assert_eq!(entry.to, title("Target"));
        assert!(site.moved.is_empty());
        assert_eq!(site.text("P1"), Some("[[Target|Old:Bar]]"));
    }

    #[test]
    fn redirects_to_a_moved_page_are_retargeted_without_display_text() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("Shortcut", "#REDIRECT [[Old:Foo#History]]"),
            ("P1", "[[Shortcut]]"),
        ]);

        run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state, false);

        assert_eq!(site.text("Shortcut"), Some("#REDIRECT [[New:Foo#History]]"));
        assert_eq!(site.text("P1"), Some("[[Shortcut]]"));
    }

    #[test]
    fn dry_run_saves_nothing_and_collects_diffs() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", true).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("P1", "See [[Old:Foo]].\n"),
        ]);

        let report = run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state, true);

        assert!(site.moved.is_empty());
        assert!(site.saved.is_empty());
        assert_eq!(report.rewrite.count("would_save"), 1);
        let (page, diff) = &report.diffs[0];
        assert_eq!(page, &title("P1"));
        assert!(diff.contains("+See [[New:Foo|Old:Foo]]."));
        assert!(report.report_path.is_none());
        assert!(!state.is_page_rewritten(&title("P1")));
    }

    #[test]
    fn resumed_run_skips_pages_already_rewritten() {
        let temp = tempdir().expect("tempdir");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("P1", "[[Old:Foo]]"),
            ("P2", "[[Old:Foo]]"),
        ]);
        {
            let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
            state.mark_page_rewritten(&title("P1")).expect("mark");
        }
        let mut state = RunState::open(temp.path(), "test-job", true).expect("resume");

        run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state, false);

        assert_eq!(site.saved_titles(), BTreeSet::from([title("P2")]));
        assert_eq!(site.text("P1"), Some("[[Old:Foo]]"));
    }

    #[test]
    fn resumed_run_does_not_move_twice() {
        let temp = tempdir().expect("tempdir");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("P1", "[[Old:Foo]]"),
        ]);
        let job = job(&[("Old:Foo", "New:Foo")]);
        {
            let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
            let namespaces = NamespaceTable::standard();
            let engine = MoveEngine::new(&namespaces, EngineSettings::default());
            let mut moved_only = Job::new("test-job", JobKind::MovePages, job.registry.clone());
            moved_only.follow_ups = FollowUpActions::empty();
            engine.run(&mut site, &moved_only, &mut state).expect("first attempt");
        }
        assert_eq!(site.moved.len(), 1);

        let mut state = RunState::open(temp.path(), "test-job", true).expect("resume");
        let report = run(&mut site, &job, &mut state, false);

        assert_eq!(site.moved.len(), 1);
        let entry = report.registry.get(&title("Old:Foo")).expect("entry");
        assert_eq!(entry.action, Some(ActionKind::Move));
        assert_eq!(site.text("P1"), Some("[[New:Foo|Old:Foo]]"));
    }

    #[test]
    fn cancelled_run_saves_nothing() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[("Old:Foo", "x"), ("P1", "[[Old:Foo]]")]);
        let namespaces = NamespaceTable::standard();
        let signals = RunSignals::new();
        signals.cancel();
        let engine =
            MoveEngine::new(&namespaces, EngineSettings::default()).with_signals(signals);

        let error = engine
            .run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state)
            .expect_err("cancelled during planning");

        assert!(error.is::<Cancelled>());
        assert!(site.saved.is_empty());
        assert!(site.moved.is_empty());
    }

    #[test]
    fn failed_move_leaves_references_alone() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "Foo content"),
            ("New:Foo", "Existing content"),
            ("P1", "[[Old:Foo]]"),
        ]);

        let report = run(&mut site, &job(&[("Old:Foo", "New:Foo")]), &mut state, false);

        let entry = report.registry.get(&title("Old:Foo")).expect("entry");
        assert_eq!(entry.action, Some(ActionKind::Skip));
        assert!(
            report
                .issues
                .iter()
                .any(|issue| issue.kind == IssueKind::CollaboratorError && issue.detail.contains("articleexists"))
        );
        assert_eq!(site.text("P1"), Some("[[Old:Foo]]"));
    }

    #[test]
    fn merge_handler_appends_into_existing_destination() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "merge", false).expect("state");
        let mut site = MockSite::with_pages(&[
            ("Help:Foo", "Help text"),
            ("Project:Foo", "Project text"),
            ("P1", "[[Help:Foo]]"),
        ]);
        let mut merge = job(&[("Help:Foo", "Project:Foo")]);
        merge.merge_handler = Some(Box::new(AppendMerge));

        let report = run(&mut site, &merge, &mut state, false);

        let entry = report.registry.get(&title("Help:Foo")).expect("entry");
        assert_eq!(entry.action, Some(ActionKind::CustomMove));
        assert_eq!(site.text("Project:Foo"), Some("Project text\n\nHelp text\n"));
        assert_eq!(site.text("Help:Foo"), Some("#REDIRECT [[Project:Foo]]\n"));
        assert_eq!(site.text("P1"), Some("[[Project:Foo|Help:Foo]]"));
    }

    #[test]
    fn chained_replacements_are_flattened() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "test-job", false).expect("state");
        let mut site = MockSite::with_pages(&[("P1", "[[A]] [[B]]")]);

        let report = run(&mut site, &job(&[("A", "B"), ("B", "C")]), &mut state, false);

        assert_eq!(report.registry.get(&title("A")).expect("entry").to, title("C"));
        assert_eq!(site.text("P1"), Some("[[C|A]] [[C|B]]"));
    }

    #[test]
    fn double_redirects_are_fixed_and_cycles_reported() {
        let mut site = MockSite::with_pages(&[
            ("A", "#REDIRECT [[B]]"),
            ("B", "#REDIRECT [[C#Part]]"),
            ("C", "Content"),
            ("X", "#REDIRECT [[Y]]"),
            ("Y", "#REDIRECT [[X]]"),
        ]);
        let namespaces = NamespaceTable::standard();
        let engine = MoveEngine::new(&namespaces, EngineSettings::default());

        let report = engine.fix_double_redirects(&mut site, &[0]).expect("fix");

        assert_eq!(report.scanned, 4);
        assert_eq!(site.text("A"), Some("#REDIRECT [[C#Part]]"));
        assert_eq!(site.text("X"), Some("#REDIRECT [[Y]]"));
        assert_eq!(site.saved_titles(), BTreeSet::from([title("A")]));
        assert!(
            report
                .issues
                .iter()
                .any(|issue| issue.kind == IssueKind::CycleDetected)
        );
    }

    #[test]
    fn plan_reports_pending_deletion_without_writing() {
        let mut site = MockSite::with_pages(&[
            ("Old:Foo", "x"),
            ("New:Foo", "y\n[[Category:Candidates for deletion]]"),
        ]);
        let namespaces = NamespaceTable::standard();
        let settings = EngineSettings {
            status_rules: StatusRules {
                deletion_categories: vec![title("Category:Candidates for deletion")],
                disambiguation_categories: Vec::new(),
            },
            ..EngineSettings::default()
        };
        let engine = MoveEngine::new(&namespaces, settings);

        let plan = engine.plan(&mut site, &job(&[("Old:Foo", "New:Foo")])).expect("plan");

        assert_eq!(plan.count(ActionKind::Skip), 1);
        assert!(site.saved.is_empty());
    }
}
