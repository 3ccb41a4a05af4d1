use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::registry::{ActionKind, Replacement};
use crate::title::{NamespaceTable, Title};

pub const STATUS_FILE: &str = "status.tsv";
pub const BACKLINKS_FILE: &str = "backlinks.txt";
pub const REPORT_FILE: &str = "report.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordKind {
    Replacement,
    Page,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replacement => "replacement",
            Self::Page => "page",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "replacement" => Some(Self::Replacement),
            "page" => Some(Self::Page),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub kind: RecordKind,
    pub action: Option<ActionKind>,
    pub reason: Option<String>,
    pub moved: bool,
    pub rewritten: bool,
}

impl StatusRecord {
    fn to_line(&self, title: &str) -> String {
        let mut fields = vec![
            sanitize(title),
            format!("kind={}", self.kind.as_str()),
        ];
        if let Some(action) = self.action {
            fields.push(format!("action={}", action.as_str()));
        }
        if let Some(reason) = &self.reason {
            fields.push(format!("reason={}", sanitize(reason)));
        }
        fields.push(format!("moved={}", self.moved));
        fields.push(format!("rewritten={}", self.rewritten));
        fields.join("\t")
    }

    fn from_line(line: &str) -> Option<(String, Self)> {
        let mut fields = line.split('\t');
        let title = fields.next()?.trim();
        if title.is_empty() {
            return None;
        }
        let mut record = Self {
            kind: RecordKind::Page,
            action: None,
            reason: None,
            moved: false,
            rewritten: false,
        };
        let mut kind_seen = false;
        for field in fields {
            let (key, value) = field.split_once('=')?;
            match key {
                "kind" => {
                    record.kind = RecordKind::parse(value)?;
                    kind_seen = true;
                }
                "action" => record.action = ActionKind::parse(value),
                "reason" => record.reason = Some(value.to_string()),
                "moved" => record.moved = value == "true",
                "rewritten" => record.rewritten = value == "true",
                _ => {}
            }
        }
        kind_seen.then(|| (title.to_string(), record))
    }
}

/// Resumable progress of one job run, kept under `<state_dir>/runs/<job>/`.
///
/// `status.tsv` is append-only; when a title appears more than once the last
/// record wins, so an interrupted write loses at most that one record.
#[derive(Debug)]
pub struct RunState {
    dir: PathBuf,
    records: BTreeMap<(RecordKind, String), StatusRecord>,
}

impl RunState {
    /// Opens the run directory. A fresh (non-resumed) run discards earlier
    /// status and backlinks files.
    pub fn open(state_dir: &Path, job_id: &str, resume: bool) -> Result<Self> {
        let dir = state_dir.join("runs").join(sanitize_job_id(job_id));
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let mut state = Self {
            dir,
            records: BTreeMap::new(),
        };
        if resume {
            state.load()?;
        } else {
            for name in [STATUS_FILE, BACKLINKS_FILE] {
                let path = state.dir.join(name);
                if path.exists() {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
        }
        Ok(state)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    fn backlinks_path(&self) -> PathBuf {
        self.dir.join(BACKLINKS_FILE)
    }

    fn load(&mut self) -> Result<()> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match StatusRecord::from_line(line) {
                Some((title, record)) => {
                    self.records.insert((record.kind, title), record);
                }
                None => warn!(line = number + 1, path = %path.display(), "skipping malformed status line"),
            }
        }
        debug!(records = self.records.len(), "loaded run status");
        Ok(())
    }

    fn append(&mut self, title: &Title, record: StatusRecord) -> Result<()> {
        let key = title.full_name();
        let path = self.status_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", record.to_line(&key))
            .with_context(|| format!("failed to write {}", path.display()))?;
        self.records.insert((record.kind, key), record);
        Ok(())
    }

    pub fn record_replacement(&mut self, replacement: &Replacement, moved: bool) -> Result<()> {
        let rewritten = self
            .replacement(&replacement.from)
            .is_some_and(|record| record.rewritten);
        self.append(
            &replacement.from,
            StatusRecord {
                kind: RecordKind::Replacement,
                action: replacement.action,
                reason: replacement.reason.clone(),
                moved,
                rewritten,
            },
        )
    }

    pub fn mark_page_rewritten(&mut self, page: &Title) -> Result<()> {
        self.append(
            page,
            StatusRecord {
                kind: RecordKind::Page,
                action: None,
                reason: None,
                moved: false,
                rewritten: true,
            },
        )
    }

    pub fn replacement(&self, source: &Title) -> Option<&StatusRecord> {
        self.records
            .get(&(RecordKind::Replacement, source.full_name()))
    }

    pub fn is_moved(&self, source: &Title) -> bool {
        self.replacement(source).is_some_and(|record| record.moved)
    }

    pub fn is_page_rewritten(&self, page: &Title) -> bool {
        self.records
            .get(&(RecordKind::Page, page.full_name()))
            .is_some_and(|record| record.rewritten)
    }

    pub fn rewritten_count(&self) -> usize {
        self.records
            .iter()
            .filter(|((kind, _), record)| *kind == RecordKind::Page && record.rewritten)
            .count()
    }

    pub fn save_backlinks(&self, pages: &[Title]) -> Result<()> {
        let path = self.backlinks_path();
        let mut content = String::new();
        for page in pages {
            content.push_str(&sanitize(&page.full_name()));
            content.push('\n');
        }
        fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Backlink set cached by an earlier attempt of this run, if any.
    pub fn load_backlinks(&self, namespaces: &NamespaceTable) -> Result<Option<Vec<Title>>> {
        let path = self.backlinks_path();
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let mut pages = Vec::new();
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match Title::parse(line, namespaces) {
                Ok(title) => pages.push(title),
                Err(error) => warn!(line, %error, "skipping malformed cached backlink"),
            }
        }
        Ok(Some(pages))
    }

    pub fn write_report(&self, report: &str) -> Result<PathBuf> {
        let path = self.report_path();
        fs::write(&path, report).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn sanitize_job_id(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        "job".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::title;
    use tempfile::tempdir;

    fn replacement(from: &str, to: &str, action: ActionKind, reason: &str) -> Replacement {
        let mut replacement = Replacement::new(title(from), title(to));
        replacement.set_outcome(action, reason);
        replacement
    }

    #[test]
    fn records_survive_resume_and_last_record_wins() {
        let temp = tempdir().expect("tempdir");
        {
            let mut state = RunState::open(temp.path(), "move-pages", false).expect("open");
            let entry = replacement("Old:Foo", "New:Foo", ActionKind::Move, "destination is free");
            state.record_replacement(&entry, false).expect("record");
            state.record_replacement(&entry, true).expect("record");
            state.mark_page_rewritten(&title("P1")).expect("mark");
        }

        let state = RunState::open(temp.path(), "move-pages", true).expect("resume");
        assert!(state.is_moved(&title("Old:Foo")));
        assert!(state.is_page_rewritten(&title("P1")));
        assert!(!state.is_page_rewritten(&title("P2")));
        let record = state.replacement(&title("Old:Foo")).expect("record");
        assert_eq!(record.action, Some(ActionKind::Move));
        assert_eq!(record.reason.as_deref(), Some("destination is free"));
        assert_eq!(state.rewritten_count(), 1);
    }

    #[test]
    fn fresh_run_discards_previous_files() {
        let temp = tempdir().expect("tempdir");
        {
            let mut state = RunState::open(temp.path(), "fix-links", false).expect("open");
            state.mark_page_rewritten(&title("P1")).expect("mark");
            state.save_backlinks(&[title("P1")]).expect("backlinks");
        }
        let state = RunState::open(temp.path(), "fix-links", false).expect("fresh");
        assert!(!state.is_page_rewritten(&title("P1")));
        assert!(
            state
                .load_backlinks(&NamespaceTable::standard())
                .expect("load")
                .is_none()
        );
    }

    #[test]
    fn backlinks_cache_round_trips_titles() {
        let temp = tempdir().expect("tempdir");
        let state = RunState::open(temp.path(), "fix-links", false).expect("open");
        state
            .save_backlinks(&[title("P1"), title("Template:Box"), title("Help:Some page")])
            .expect("save");
        let cached = state
            .load_backlinks(&NamespaceTable::standard())
            .expect("load")
            .expect("cached");
        assert_eq!(cached, vec![title("P1"), title("Template:Box"), title("Help:Some page")]);
    }

    #[test]
    fn reasons_with_tabs_stay_on_one_line() {
        let temp = tempdir().expect("tempdir");
        let mut state = RunState::open(temp.path(), "a/b c", false).expect("open");
        assert!(state.dir().ends_with("runs/a_b_c"));
        let entry = replacement("A", "B", ActionKind::Skip, "line one\nline\ttwo");
        state.record_replacement(&entry, false).expect("record");
        let content = fs::read_to_string(state.dir().join(STATUS_FILE)).expect("read");
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("reason=line one line two"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("runs").join("job");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(
            dir.join(STATUS_FILE),
            "garbage without fields\nP1\tkind=page\trewritten=true\nP2\tkind=bogus\n",
        )
        .expect("write");
        let state = RunState::open(temp.path(), "job", true).expect("resume");
        assert!(state.is_page_rewritten(&title("P1")));
        assert_eq!(state.rewritten_count(), 1);
    }
}
