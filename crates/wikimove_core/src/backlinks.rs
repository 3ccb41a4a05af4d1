use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::{Cancelled, Issue, IssueKind, SiteError};
use crate::site::{BacklinkKind, Page, WikiRead, WikiWrite};
use crate::title::Title;

pub const MIN_CHUNK_SIZE: usize = 10;
pub const MAX_CHUNK_SIZE: usize = 500;
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Cooperative cancel and pause flags shared between a run and whoever controls it.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Blocks while paused; fails once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        let mut logged = false;
        loop {
            if self.is_cancelled() {
                return Err(Cancelled);
            }
            if !self.pause.load(Ordering::SeqCst) {
                return Ok(());
            }
            if !logged {
                info!("run paused");
                logged = true;
            }
            sleep(PAUSE_POLL);
        }
    }
}

pub fn clamp_chunk_size(requested: usize) -> usize {
    requested.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Also collect members of source titles that are categories.
    pub include_category_members: bool,
    /// Include redirects to each source and the pages referencing those redirects.
    pub follow_redirects: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            include_category_members: false,
            follow_redirects: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub pages: BTreeSet<Title>,
    /// Redirect pages found while following redirects. Also present in `pages`.
    pub redirects: BTreeSet<Title>,
    pub issues: Vec<Issue>,
}

/// Pages that reference any of `sources` by link, transclusion or file usage.
///
/// A failed lookup for one source is recorded as an issue and the others
/// still proceed.
pub fn discover_backlinks<S: WikiRead + ?Sized>(
    site: &mut S,
    sources: &[Title],
    options: DiscoveryOptions,
    signals: &RunSignals,
) -> Result<Discovery, Cancelled> {
    let mut discovery = Discovery::default();
    for source in sources {
        signals.checkpoint()?;
        if let Err(error) = discover_one(site, source, options, &mut discovery) {
            warn!(source = %source, %error, "backlink lookup failed");
            discovery.issues.push(Issue::new(
                IssueKind::CollaboratorError,
                source.to_string(),
                format!("backlink lookup failed: {error}"),
            ));
        }
    }
    info!(
        sources = sources.len(),
        pages = discovery.pages.len(),
        redirects = discovery.redirects.len(),
        "discovered backlinks"
    );
    Ok(discovery)
}

fn discover_one<S: WikiRead + ?Sized>(
    site: &mut S,
    source: &Title,
    options: DiscoveryOptions,
    discovery: &mut Discovery,
) -> Result<(), SiteError> {
    let referencing = site.backlinks(source, &BacklinkKind::REFERENCES)?;
    debug!(source = %source, count = referencing.len(), "direct backlinks");
    discovery.pages.extend(referencing);

    if options.follow_redirects {
        let redirects = site.backlinks(source, &[BacklinkKind::Redirect])?;
        for redirect in redirects {
            let via = site.backlinks(&redirect, &BacklinkKind::REFERENCES)?;
            discovery.pages.extend(via);
            discovery.pages.insert(redirect.clone());
            discovery.redirects.insert(redirect);
        }
    }

    if options.include_category_members && source.is_category() {
        discovery.pages.extend(site.category_members(source)?);
    }
    Ok(())
}

/// What a visit decided for one loaded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEdit {
    Unchanged,
    Save { summary: String, minor: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResult {
    Saved { attempts: usize },
    /// Dry run: the page would have been saved.
    WouldSave,
    Unchanged,
    Missing,
    Failed(String),
}

impl PageResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved { .. } => "saved",
            Self::WouldSave => "would_save",
            Self::Unchanged => "unchanged",
            Self::Missing => "missing",
            Self::Failed(_) => "failed",
        }
    }

    /// The page needs no further work on resume.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Saved { .. } | Self::Unchanged | Self::Missing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub chunk_size: usize,
    pub max_save_retries: usize,
    pub dry_run: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            max_save_retries: crate::config::DEFAULT_MAX_SAVE_RETRIES,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<(Title, PageResult)>,
    pub issues: Vec<Issue>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn count(&self, label: &str) -> usize {
        self.results
            .iter()
            .filter(|(_, result)| result.as_str() == label)
            .count()
    }

    fn record(&mut self, title: Title, result: PageResult) {
        if let PageResult::Failed(detail) = &result {
            self.issues.push(Issue::new(
                IssueKind::CollaboratorError,
                title.to_string(),
                detail.clone(),
            ));
        }
        self.results.push((title, result));
    }
}

/// Loads `titles` in bounded chunks, runs `visit` on each page and saves the
/// ones it changed.
///
/// A chunk that fails to load marks each of its titles failed and the next
/// chunk proceeds. `on_result` is called as soon as each page settles so
/// progress can be persisted. Cancellation is only observed between pages.
pub fn process_in_chunks<S, V, R>(
    site: &mut S,
    titles: &[Title],
    options: &BatchOptions,
    signals: &RunSignals,
    mut visit: V,
    mut on_result: R,
) -> BatchReport
where
    S: WikiWrite + ?Sized,
    V: FnMut(&mut Page) -> Result<PageEdit>,
    R: FnMut(&Title, &PageResult),
{
    let chunk_size = clamp_chunk_size(options.chunk_size);
    let mut report = BatchReport::default();

    for (index, chunk) in titles.chunks(chunk_size).enumerate() {
        if signals.checkpoint().is_err() {
            report.cancelled = true;
            break;
        }
        debug!(chunk = index, size = chunk.len(), "loading chunk");
        let pages = match site.load_pages(chunk) {
            Ok(pages) => pages,
            Err(error) => {
                warn!(chunk = index, %error, "chunk failed to load");
                for title in chunk {
                    let result = PageResult::Failed(format!("load failed: {error}"));
                    on_result(title, &result);
                    report.record(title.clone(), result);
                }
                continue;
            }
        };

        for page in pages {
            if signals.checkpoint().is_err() {
                report.cancelled = true;
                break;
            }
            let title = page.title.clone();
            let result = if page.exists {
                match save_with_retry(site, page, &mut visit, options, signals) {
                    Ok(result) => result,
                    Err(error) if error.is::<Cancelled>() => {
                        report.cancelled = true;
                        break;
                    }
                    Err(error) => PageResult::Failed(format!("{error:#}")),
                }
            } else {
                PageResult::Missing
            };
            on_result(&title, &result);
            report.record(title, result);
        }
        if report.cancelled {
            break;
        }
    }

    info!(
        pages = report.results.len(),
        saved = report.count("saved"),
        failed = report.count("failed"),
        cancelled = report.cancelled,
        "batch finished"
    );
    report
}

/// Visits and saves one page, reloading and re-visiting it after a transient
/// save failure such as an edit conflict.
pub fn save_with_retry<S, V>(
    site: &mut S,
    page: Page,
    visit: &mut V,
    options: &BatchOptions,
    signals: &RunSignals,
) -> Result<PageResult>
where
    S: WikiWrite + ?Sized,
    V: FnMut(&mut Page) -> Result<PageEdit>,
{
    let mut page = page;
    let attempts = options.max_save_retries.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let edit = visit(&mut page).with_context(|| format!("failed to rewrite {}", page.title))?;
        let PageEdit::Save { summary, minor } = edit else {
            return Ok(PageResult::Unchanged);
        };
        if options.dry_run {
            return Ok(PageResult::WouldSave);
        }
        signals.checkpoint()?;
        match site.save_page(&page, &summary, minor) {
            Ok(()) => {
                debug!(title = %page.title, attempt, "saved page");
                return Ok(PageResult::Saved { attempts: attempt });
            }
            Err(error) if error.is_transient() && attempt < attempts => {
                warn!(title = %page.title, attempt, %error, "save failed, reloading");
                let title = page.title.clone();
                page = site
                    .load_pages(std::slice::from_ref(&title))?
                    .into_iter()
                    .next()
                    .filter(|reloaded| reloaded.exists)
                    .ok_or(SiteError::MissingPage {
                        title: title.full_name(),
                    })?;
            }
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("failed to save {}", page.title)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSite, title};

    fn replace_visit(from: &'static str, to: &'static str) -> impl FnMut(&mut Page) -> Result<PageEdit> {
        move |page: &mut Page| {
            if !page.text.contains(from) {
                return Ok(PageEdit::Unchanged);
            }
            page.text = page.text.replace(from, to);
            Ok(PageEdit::Save {
                summary: "test".to_string(),
                minor: true,
            })
        }
    }

    #[test]
    fn chunk_size_is_clamped() {
        assert_eq!(clamp_chunk_size(1), MIN_CHUNK_SIZE);
        assert_eq!(clamp_chunk_size(50), 50);
        assert_eq!(clamp_chunk_size(10_000), MAX_CHUNK_SIZE);
    }

    #[test]
    fn paused_run_waits_until_resumed() {
        let signals = RunSignals::new();
        signals.set_paused(true);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let worker = {
            let signals = signals.clone();
            std::thread::spawn(move || {
                let result = signals.checkpoint();
                done_tx.send(()).expect("notify");
                result
            })
        };

        assert!(done_rx.recv_timeout(PAUSE_POLL * 3).is_err());
        signals.set_paused(false);
        done_rx.recv_timeout(Duration::from_secs(5)).expect("resumed");
        assert!(worker.join().expect("join").is_ok());
    }

    #[test]
    fn cancelling_a_paused_run_releases_it() {
        let signals = RunSignals::new();
        signals.set_paused(true);
        let worker = {
            let signals = signals.clone();
            std::thread::spawn(move || signals.checkpoint())
        };

        sleep(PAUSE_POLL * 2);
        signals.cancel();
        assert_eq!(worker.join().expect("join"), Err(Cancelled));
    }

    #[test]
    fn discovery_follows_redirects_one_level() {
        let mut site = MockSite::with_pages(&[
            ("Old Foo", "content"),
            ("P1", "[[Old Foo]]"),
            ("P2", "{{:Old Foo}}"),
            ("Foo alias", "#REDIRECT [[Old Foo]]"),
            ("P3", "[[Foo alias|see]]"),
            ("Unrelated", "[[Elsewhere]]"),
        ]);
        let discovery = discover_backlinks(
            &mut site,
            &[title("Old Foo")],
            DiscoveryOptions::default(),
            &RunSignals::new(),
        )
        .expect("discovery");
        let expected: BTreeSet<Title> = ["P1", "P2", "P3", "Foo alias"].into_iter().map(title).collect();
        assert_eq!(discovery.pages, expected);
        assert_eq!(discovery.redirects, BTreeSet::from([title("Foo alias")]));
        assert!(discovery.issues.is_empty());
    }

    #[test]
    fn category_members_only_when_requested() {
        let mut site = MockSite::with_pages(&[
            ("Category:Old", "category page"),
            ("Member", "text [[Category:Old]]"),
        ]);
        let plain = discover_backlinks(
            &mut site,
            &[title("Category:Old")],
            DiscoveryOptions::default(),
            &RunSignals::new(),
        )
        .expect("discovery");
        assert!(plain.pages.is_empty());

        let with_members = discover_backlinks(
            &mut site,
            &[title("Category:Old")],
            DiscoveryOptions {
                include_category_members: true,
                follow_redirects: false,
            },
            &RunSignals::new(),
        )
        .expect("discovery");
        assert_eq!(with_members.pages, BTreeSet::from([title("Member")]));
    }

    #[test]
    fn cancelled_discovery_stops() {
        let mut site = MockSite::with_pages(&[("P1", "[[Old]]")]);
        let signals = RunSignals::new();
        signals.cancel();
        let result = discover_backlinks(&mut site, &[title("Old")], DiscoveryOptions::default(), &signals);
        assert_eq!(result.err(), Some(Cancelled));
    }

    #[test]
    fn failed_chunk_does_not_lose_other_chunks() {
        let mut pages = Vec::new();
        for index in 0..25 {
            pages.push((format!("Page {index:02}"), "[[Old]]".to_string()));
        }
        let borrowed: Vec<(&str, &str)> = pages.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let mut site = MockSite::with_pages(&borrowed);
        site.failing_loads.insert(title("Page 12"));
        let titles: Vec<Title> = pages.iter().map(|(name, _)| title(name)).collect();

        let mut seen = Vec::new();
        let report = process_in_chunks(
            &mut site,
            &titles,
            &BatchOptions {
                chunk_size: 10,
                ..BatchOptions::default()
            },
            &RunSignals::new(),
            replace_visit("[[Old]]", "[[New]]"),
            |title, result| seen.push((title.clone(), result.clone())),
        );

        assert_eq!(report.count("saved"), 15);
        assert_eq!(report.count("failed"), 10);
        assert_eq!(report.issues.len(), 10);
        assert_eq!(seen.len(), 25);
        assert_eq!(site.text("Page 00"), Some("[[New]]"));
        assert_eq!(site.text("Page 12"), Some("[[Old]]"));
        assert_eq!(site.text("Page 24"), Some("[[New]]"));
    }

    #[test]
    fn edit_conflict_reloads_and_revisits() {
        let mut site = MockSite::with_pages(&[("P1", "[[Old]]")]);
        site.conflicts.insert(title("P1"), 1);
        let mut visits = 0;
        let report = process_in_chunks(
            &mut site,
            &[title("P1")],
            &BatchOptions::default(),
            &RunSignals::new(),
            |page: &mut Page| {
                visits += 1;
                page.text = page.text.replace("[[Old]]", "[[New]]");
                Ok(PageEdit::Save {
                    summary: "test".to_string(),
                    minor: true,
                })
            },
            |_, _| {},
        );
        assert_eq!(visits, 2);
        assert_eq!(report.results[0].1, PageResult::Saved { attempts: 2 });
    }

    #[test]
    fn permanent_save_failure_is_reported_per_page() {
        let mut site = MockSite::with_pages(&[("P1", "[[Old]]"), ("P2", "[[Old]]")]);
        site.failing_saves.insert(title("P1"));
        let report = process_in_chunks(
            &mut site,
            &[title("P1"), title("P2"), title("Gone")],
            &BatchOptions::default(),
            &RunSignals::new(),
            replace_visit("[[Old]]", "[[New]]"),
            |_, _| {},
        );
        assert!(matches!(report.results[0].1, PageResult::Failed(_)));
        assert_eq!(report.results[1].1, PageResult::Saved { attempts: 1 });
        assert_eq!(report.results[2].1, PageResult::Missing);
        assert_eq!(report.issues[0].kind, IssueKind::CollaboratorError);
    }

    #[test]
    fn dry_run_never_saves() {
        let mut site = MockSite::with_pages(&[("P1", "[[Old]]"), ("P2", "nothing")]);
        let report = process_in_chunks(
            &mut site,
            &[title("P1"), title("P2")],
            &BatchOptions {
                dry_run: true,
                ..BatchOptions::default()
            },
            &RunSignals::new(),
            replace_visit("[[Old]]", "[[New]]"),
            |_, _| {},
        );
        assert_eq!(report.results[0].1, PageResult::WouldSave);
        assert_eq!(report.results[1].1, PageResult::Unchanged);
        assert!(site.saved.is_empty());
    }

    #[test]
    fn cancellation_before_any_save_leaves_pages_untouched() {
        let mut site = MockSite::with_pages(&[("P1", "[[Old]]")]);
        let signals = RunSignals::new();
        signals.cancel();
        let report = process_in_chunks(
            &mut site,
            &[title("P1")],
            &BatchOptions::default(),
            &signals,
            replace_visit("[[Old]]", "[[New]]"),
            |_, _| {},
        );
        assert!(report.cancelled);
        assert!(report.results.is_empty());
        assert_eq!(site.text("P1"), Some("[[Old]]"));
    }
}
