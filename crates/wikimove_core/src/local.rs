use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{SiteError, SiteResult};
use crate::rewrite::{gallery_file, template_target};
use crate::site::{BacklinkKind, MoveOptions, Page, PageInfo, PurgeMethod, WikiRead, WikiWrite};
use crate::title::{NS_CATEGORY, NS_FILE, NS_MAIN, NS_MEDIA, NamespaceTable, Title};
use crate::wikitext::{self, Node};

const MAIN_FOLDER: &str = "Main";
const PAGE_EXTENSION: &str = "wiki";
const DISAMBIGUATION_MARKER: &str = "__DISAMBIG__";

const MIRROR_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS mirror_pages (
    title_key TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    namespace INTEGER NOT NULL,
    relative_path TEXT NOT NULL,
    redirect_target TEXT,
    content_hash TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    indexed_at_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mirror_pages_namespace ON mirror_pages(namespace);

CREATE TABLE IF NOT EXISTS mirror_links (
    source_key TEXT NOT NULL,
    source_title TEXT NOT NULL,
    target_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (source_key, target_key, kind),
    FOREIGN KEY (source_key) REFERENCES mirror_pages(title_key) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_mirror_links_target ON mirror_links(target_key, kind);
"#;

/// Outgoing dependency recorded in the link index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum LinkKind {
    Backlink(BacklinkKind),
    Category,
}

impl LinkKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Backlink(kind) => kind.as_str(),
            Self::Category => "category",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub db_path: String,
    pub pages: usize,
    pub links: usize,
    pub redirects: usize,
}

/// A directory of `.wiki` files acting as a site, with a SQLite link index
/// standing in for the site's backlink tables.
///
/// Layout: `<content_dir>/<Namespace>/<Page_name>.wiki`, main namespace pages
/// under `Main/`. Subpage slashes are stored as `___` and colons as `--`.
pub struct LocalSite {
    content_dir: PathBuf,
    db_path: PathBuf,
    connection: Connection,
    namespaces: NamespaceTable,
    request_count: usize,
}

impl LocalSite {
    pub fn open(content_dir: &Path, db_path: &Path, namespaces: NamespaceTable) -> Result<Self> {
        fs::create_dir_all(content_dir)
            .with_context(|| format!("failed to create {}", content_dir.display()))?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database parent directory {}",
                    parent.display()
                )
            })?;
        }
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(MIRROR_SCHEMA_SQL)
            .context("failed to initialize mirror index schema")?;
        Ok(Self {
            content_dir: content_dir.to_path_buf(),
            db_path: db_path.to_path_buf(),
            connection,
            namespaces,
            request_count: 0,
        })
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.namespaces
    }

    /// Rebuilds the index when it holds no pages yet.
    pub fn ensure_index(&mut self) -> Result<()> {
        let indexed: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM mirror_pages", [], |row| row.get(0))
            .context("failed to count mirror_pages")?;
        if indexed == 0 {
            self.rebuild_index()?;
        }
        Ok(())
    }

    pub fn rebuild_index(&mut self) -> Result<RebuildReport> {
        let files = self.scan()?;
        let indexed_at = unix_timestamp()?;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start index rebuild transaction")?;
        transaction
            .execute("DELETE FROM mirror_pages", [])
            .context("failed to clear mirror_pages table")?;

        let mut pages = 0usize;
        let mut links = 0usize;
        let mut redirects = 0usize;
        for (title, path) in &files {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let entry = IndexEntry::build(title, &content, &self.namespaces);
            links += entry.write(&transaction, &relative_display(&self.content_dir, path), indexed_at)?;
            if entry.redirect_target.is_some() {
                redirects += 1;
            }
            pages += 1;
        }
        transaction
            .commit()
            .context("failed to commit index rebuild transaction")?;

        info!(pages, links, redirects, "rebuilt mirror link index");
        Ok(RebuildReport {
            db_path: self.db_path.display().to_string(),
            pages,
            links,
            redirects,
        })
    }

    /// Path of the file that holds `title`, or `None` for titles a mirror cannot store.
    pub fn page_path(&self, title: &Title) -> Option<PathBuf> {
        if title.is_interwiki() || title.namespace() < NS_MAIN {
            return None;
        }
        let folder = if title.namespace() == NS_MAIN {
            MAIN_FOLDER.to_string()
        } else {
            title.namespace_name().replace(' ', "_")
        };
        let file_name = format!("{}.{PAGE_EXTENSION}", encode_segment(title.page_name()));
        Some(self.content_dir.join(folder).join(file_name))
    }

    /// Title stored for a page key, if the page is indexed.
    pub fn indexed_title(&self, title: &Title) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT title FROM mirror_pages WHERE title_key = ?1",
                params![title.storage_key()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query mirror_pages")
    }

    fn require_path(&self, title: &Title) -> SiteResult<PathBuf> {
        self.page_path(title).ok_or_else(|| SiteError::Api {
            code: "invalidtitle".to_string(),
            info: format!("{title} cannot be stored in a local mirror"),
        })
    }

    fn title_for_path(&self, path: &Path) -> Option<Title> {
        let relative = path.strip_prefix(&self.content_dir).ok()?;
        let mut components = relative.components();
        let folder = components.next()?.as_os_str().to_str()?;
        let file = components.next()?.as_os_str().to_str()?;
        if components.next().is_some() {
            return None;
        }
        let stem = file.strip_suffix(&format!(".{PAGE_EXTENSION}"))?;
        let namespace = if folder == MAIN_FOLDER {
            NS_MAIN
        } else {
            self.namespaces.lookup(&folder.replace('_', " "))?
        };
        Title::new(namespace, &decode_segment(stem), &self.namespaces).ok()
    }

    fn scan(&self) -> Result<Vec<(Title, PathBuf)>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.content_dir).follow_links(false) {
            let entry =
                entry.with_context(|| format!("failed to walk {}", self.content_dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PAGE_EXTENSION) {
                continue;
            }
            match self.title_for_path(path) {
                Some(title) => out.push((title, path.to_path_buf())),
                None => warn!(path = %path.display(), "skipping file that does not map to a title"),
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_current(&self, title: &Title) -> SiteResult<Option<String>> {
        let Some(path) = self.page_path(title) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn reindex(&mut self, title: &Title) -> SiteResult<()> {
        let content = self.read_current(title)?;
        let path = self.page_path(title);
        let indexed_at = unix_timestamp()?;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start page reindex transaction")?;
        transaction
            .execute(
                "DELETE FROM mirror_pages WHERE title_key = ?1",
                params![title.storage_key()],
            )
            .with_context(|| format!("failed to remove index rows for {title}"))?;
        if let (Some(content), Some(path)) = (content, path) {
            let entry = IndexEntry::build(title, &content, &self.namespaces);
            entry.write(&transaction, &relative_display(&self.content_dir, &path), indexed_at)?;
        }
        transaction
            .commit()
            .context("failed to commit page reindex transaction")?;
        Ok(())
    }

    fn query_sources(&self, target: &Title, kind: LinkKind) -> SiteResult<Vec<Title>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT source_title FROM mirror_links
                 WHERE target_key = ?1 AND kind = ?2
                 ORDER BY source_key",
            )
            .context("failed to prepare backlink query")?;
        let rows = statement
            .query_map(params![target.storage_key(), kind.as_str()], |row| {
                row.get::<_, String>(0)
            })
            .context("failed to run backlink query")?;
        let mut out = Vec::new();
        for row in rows {
            let source = row.context("failed to decode backlink row")?;
            out.push(self.parse_stored(&source)?);
        }
        Ok(out)
    }

    fn parse_stored(&self, value: &str) -> SiteResult<Title> {
        Title::parse(value, &self.namespaces)
            .with_context(|| format!("index holds malformed title {value:?}"))
            .map_err(SiteError::from)
    }

    fn move_one(&mut self, from: &Title, to: &Title, leave_redirect: bool) -> SiteResult<()> {
        let from_path = self.require_path(from)?;
        let to_path = self.require_path(to)?;
        if !from_path.is_file() {
            return Err(SiteError::MissingPage {
                title: from.full_name(),
            });
        }
        if to_path.exists() {
            return Err(SiteError::Api {
                code: "articleexists".to_string(),
                info: format!("{} already exists", to.full_name()),
            });
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::rename(&from_path, &to_path).with_context(|| {
            format!(
                "failed to move {} to {}",
                from_path.display(),
                to_path.display()
            )
        })?;
        if leave_redirect {
            let redirect = format!("#REDIRECT [[{}]]\n", to.full_name());
            fs::write(&from_path, redirect)
                .with_context(|| format!("failed to write {}", from_path.display()))?;
        }
        self.reindex(from)?;
        self.reindex(to)?;
        debug!(from = %from, to = %to, leave_redirect, "moved mirror page");
        Ok(())
    }

    fn subpages(&self, title: &Title) -> SiteResult<Vec<Title>> {
        let prefix = format!("{}/", title.full_name());
        let mut statement = self
            .connection
            .prepare(
                "SELECT title FROM mirror_pages
                 WHERE namespace = ?1 AND substr(title, 1, length(?2)) = ?2
                 ORDER BY title",
            )
            .context("failed to prepare subpage query")?;
        let rows = statement
            .query_map(params![title.namespace(), prefix], |row| row.get::<_, String>(0))
            .context("failed to run subpage query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(self.parse_stored(&row.context("failed to decode subpage row")?)?);
        }
        Ok(out)
    }

    fn talk_pair(&self, from: &Title, to: &Title) -> Option<(Title, Title)> {
        let talk_of = |title: &Title| {
            let namespace = title.namespace();
            if namespace < NS_MAIN || namespace % 2 == 1 {
                return None;
            }
            self.namespaces.get(namespace + 1)?;
            title.in_namespace(namespace + 1, &self.namespaces).ok()
        };
        Some((talk_of(from)?, talk_of(to)?))
    }
}

impl WikiRead for LocalSite {
    fn backlinks(&mut self, title: &Title, kinds: &[BacklinkKind]) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        let mut found = BTreeSet::new();
        for kind in kinds {
            found.extend(self.query_sources(title, LinkKind::Backlink(*kind))?);
        }
        Ok(found.into_iter().collect())
    }

    fn category_members(&mut self, category: &Title) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        self.query_sources(category, LinkKind::Category)
    }

    fn load_pages(&mut self, titles: &[Title]) -> SiteResult<Vec<Page>> {
        self.request_count += 1;
        let mut pages = Vec::with_capacity(titles.len());
        for title in titles {
            let page = match self.read_current(title)? {
                Some(text) => {
                    let mut page = Page::new(title.without_fragment(), text);
                    page.base_hash = Some(compute_hash(&page.text));
                    page
                }
                None => Page::missing(title.without_fragment()),
            };
            pages.push(page);
        }
        Ok(pages)
    }

    fn page_info(&mut self, titles: &[Title]) -> SiteResult<Vec<PageInfo>> {
        self.request_count += 1;
        let mut out = Vec::with_capacity(titles.len());
        for title in titles {
            let title = title.without_fragment();
            let Some(content) = self.read_current(&title)? else {
                out.push(PageInfo::missing(title));
                continue;
            };
            let entry = IndexEntry::build(&title, &content, &self.namespaces);
            out.push(PageInfo {
                title,
                exists: true,
                redirect_target: entry.redirect_target,
                disambiguation: content.contains(DISAMBIGUATION_MARKER),
                categories: entry.categories,
            });
        }
        Ok(out)
    }

    fn list_redirects(&mut self, namespaces: &[i32]) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        let mut statement = self
            .connection
            .prepare(
                "SELECT title FROM mirror_pages
                 WHERE namespace = ?1 AND redirect_target IS NOT NULL
                 ORDER BY title_key",
            )
            .context("failed to prepare redirect listing")?;
        let mut out = Vec::new();
        for namespace in namespaces {
            let rows = statement
                .query_map(params![namespace], |row| row.get::<_, String>(0))
                .context("failed to list redirects")?;
            for row in rows {
                out.push(self.parse_stored(&row.context("failed to decode redirect row")?)?);
            }
        }
        Ok(out)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWrite for LocalSite {
    fn save_page(&mut self, page: &Page, summary: &str, minor: bool) -> SiteResult<()> {
        self.request_count += 1;
        let path = self.require_path(&page.title)?;
        let current = self.read_current(&page.title)?;
        match (&current, page.exists) {
            (Some(_), false) => {
                return Err(SiteError::EditConflict {
                    title: page.title.full_name(),
                });
            }
            (None, true) => {
                return Err(SiteError::MissingPage {
                    title: page.title.full_name(),
                });
            }
            (Some(text), true) => {
                if let Some(base) = &page.base_hash
                    && *base != compute_hash(text)
                {
                    return Err(SiteError::EditConflict {
                        title: page.title.full_name(),
                    });
                }
            }
            (None, false) => {}
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, &page.text).with_context(|| format!("failed to write {}", path.display()))?;
        self.reindex(&page.title)?;
        debug!(title = %page.title, summary, minor, "saved mirror page");
        Ok(())
    }

    fn move_page(&mut self, from: &Title, to: &Title, options: &MoveOptions) -> SiteResult<()> {
        self.request_count += 1;
        let subpages = if options.move_subpages {
            self.subpages(from)?
        } else {
            Vec::new()
        };
        self.move_one(from, to, options.leave_redirect)?;

        if options.move_talk
            && let Some((from_talk, to_talk)) = self.talk_pair(from, to)
            && self.read_current(&from_talk)?.is_some()
            && let Err(error) = self.move_one(&from_talk, &to_talk, options.leave_redirect)
        {
            warn!(from = %from_talk, to = %to_talk, %error, "talk page was not moved");
        }

        let prefix_len = from.page_name().len();
        for subpage in subpages {
            let suffix = &subpage.page_name()[prefix_len..];
            let target = Title::new(to.namespace(), &format!("{}{suffix}", to.page_name()), &self.namespaces)
                .with_context(|| format!("cannot derive subpage target for {subpage}"))?;
            if let Err(error) = self.move_one(&subpage, &target, options.leave_redirect) {
                warn!(from = %subpage, to = %target, %error, "subpage was not moved");
            }
        }
        Ok(())
    }

    fn purge(&mut self, titles: &[Title], method: PurgeMethod) -> SiteResult<()> {
        self.request_count += 1;
        for title in titles {
            self.reindex(&title.without_fragment())?;
        }
        debug!(count = titles.len(), ?method, "refreshed mirror index rows");
        Ok(())
    }
}

/// Index rows derived from one page's content.
pub(crate) struct IndexEntry {
    title: Title,
    pub(crate) redirect_target: Option<Title>,
    pub(crate) categories: Vec<Title>,
    pub(crate) links: BTreeSet<(LinkKind, Title)>,
    hash: String,
    bytes: usize,
}

impl IndexEntry {
    pub(crate) fn build(title: &Title, content: &str, namespaces: &NamespaceTable) -> Self {
        let nodes = wikitext::parse(content);
        let redirect_target = wikitext::redirect_link(&nodes)
            .and_then(|link| Title::parse(&link.target, namespaces).ok());
        let mut links = outgoing_links(&nodes, namespaces);
        if let Some(target) = &redirect_target {
            // redirects are listed apart from ordinary links, as MediaWiki does
            links.remove(&(LinkKind::Backlink(BacklinkKind::Link), target.without_fragment()));
            links.insert((LinkKind::Backlink(BacklinkKind::Redirect), target.without_fragment()));
        }
        let categories = links
            .iter()
            .filter(|(kind, _)| *kind == LinkKind::Category)
            .map(|(_, target)| target.clone())
            .collect();
        Self {
            title: title.without_fragment(),
            redirect_target,
            categories,
            links,
            hash: compute_hash(content),
            bytes: content.len(),
        }
    }

    fn write(&self, connection: &Connection, relative_path: &str, indexed_at: u64) -> Result<usize> {
        connection
            .execute(
                "INSERT INTO mirror_pages (
                    title_key, title, namespace, relative_path,
                    redirect_target, content_hash, bytes, indexed_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    self.title.storage_key(),
                    self.title.full_name(),
                    self.title.namespace(),
                    relative_path,
                    self.redirect_target.as_ref().map(ToString::to_string),
                    self.hash,
                    i64::try_from(self.bytes).context("bytes value does not fit into i64")?,
                    i64::try_from(indexed_at).context("timestamp does not fit into i64")?,
                ],
            )
            .with_context(|| format!("failed to insert {}", self.title))?;
        let mut statement = connection
            .prepare_cached(
                "INSERT OR IGNORE INTO mirror_links (source_key, source_title, target_key, kind)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .context("failed to prepare mirror_links insert")?;
        let mut inserted = 0usize;
        for (kind, target) in &self.links {
            inserted += statement
                .execute(params![
                    self.title.storage_key(),
                    self.title.full_name(),
                    target.storage_key(),
                    kind.as_str()
                ])
                .with_context(|| format!("failed to insert links for {}", self.title))?;
        }
        Ok(inserted)
    }
}

fn outgoing_links(nodes: &[Node], namespaces: &NamespaceTable) -> BTreeSet<(LinkKind, Title)> {
    let mut out = BTreeSet::new();
    wikitext::visit(nodes, &mut |node| match node {
        Node::Link(link) => {
            let target = link.target.trim();
            let Ok(title) = Title::parse(target, namespaces) else {
                return;
            };
            if title.is_interwiki() {
                return;
            }
            let colon = target.starts_with(':');
            let title = title.without_fragment();
            let kind = if title.namespace() == NS_CATEGORY && !colon {
                LinkKind::Category
            } else if title.namespace() == NS_MEDIA || (title.namespace() == NS_FILE && !colon) {
                LinkKind::Backlink(BacklinkKind::FileUsage)
            } else if title.namespace() >= NS_MAIN {
                LinkKind::Backlink(BacklinkKind::Link)
            } else {
                return;
            };
            let title = if title.namespace() == NS_MEDIA {
                match title.in_namespace(NS_FILE, namespaces) {
                    Ok(file) => file,
                    Err(_) => return,
                }
            } else {
                title
            };
            out.insert((kind, title));
        }
        Node::Template(template) => {
            if let Some((_, title)) = template_target(template, namespaces)
                && !title.is_interwiki()
            {
                out.insert((LinkKind::Backlink(BacklinkKind::Transclusion), title.without_fragment()));
            }
        }
        Node::Gallery(gallery) => {
            for line in &gallery.lines {
                if let Some((title, _)) = gallery_file(line, namespaces)
                    && title.namespace() == NS_FILE
                {
                    out.insert((LinkKind::Backlink(BacklinkKind::FileUsage), title.without_fragment()));
                }
            }
        }
        Node::Text(_) | Node::Header(_) | Node::Argument(_) => {}
    });
    out
}

pub(crate) fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn encode_segment(page_name: &str) -> String {
    page_name
        .replace(' ', "_")
        .replace('/', "___")
        .replace(':', "--")
}

fn decode_segment(value: &str) -> String {
    value
        .replace("___", "/")
        .replace("--", ":")
        .replace('_', " ")
}

fn relative_display(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.to_string_lossy().replace('\\', "/")
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before unix epoch")?
        .as_secs())
}
