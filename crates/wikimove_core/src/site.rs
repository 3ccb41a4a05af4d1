use serde::{Deserialize, Serialize};

use crate::error::SiteResult;
use crate::title::Title;

/// Ways one page can depend on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BacklinkKind {
    Link,
    Transclusion,
    FileUsage,
    /// Pages that redirect to the title.
    Redirect,
}

impl BacklinkKind {
    pub const REFERENCES: [BacklinkKind; 3] = [Self::Link, Self::Transclusion, Self::FileUsage];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Transclusion => "transclusion",
            Self::FileUsage => "file-usage",
            Self::Redirect => "redirect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: Title,
    pub text: String,
    pub exists: bool,
    pub revision_id: Option<i64>,
    pub timestamp: Option<String>,
    /// Content hash at load time, used by mirrors without revision ids.
    pub base_hash: Option<String>,
}

impl Page {
    pub fn new(title: Title, text: impl Into<String>) -> Self {
        Self {
            title,
            text: text.into(),
            exists: true,
            revision_id: None,
            timestamp: None,
            base_hash: None,
        }
    }

    pub fn missing(title: Title) -> Self {
        Self {
            title,
            text: String::new(),
            exists: false,
            revision_id: None,
            timestamp: None,
            base_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub title: Title,
    pub exists: bool,
    /// Target of the page's redirect directive, with fragment.
    pub redirect_target: Option<Title>,
    /// Set from the `disambiguation` page property.
    pub disambiguation: bool,
    pub categories: Vec<Title>,
}

impl PageInfo {
    pub fn missing(title: Title) -> Self {
        Self {
            title,
            exists: false,
            redirect_target: None,
            disambiguation: false,
            categories: Vec::new(),
        }
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect_target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOptions {
    pub reason: String,
    pub leave_redirect: bool,
    pub move_talk: bool,
    pub move_subpages: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            reason: String::new(),
            leave_redirect: true,
            move_talk: true,
            move_subpages: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PurgeMethod {
    #[default]
    Purge,
    ForceLinkUpdate,
    ForceRecursiveLinkUpdate,
}

pub trait WikiRead {
    fn backlinks(&mut self, title: &Title, kinds: &[BacklinkKind]) -> SiteResult<Vec<Title>>;
    fn category_members(&mut self, category: &Title) -> SiteResult<Vec<Title>>;
    /// Loads pages in request order. Missing pages come back with `exists == false`.
    fn load_pages(&mut self, titles: &[Title]) -> SiteResult<Vec<Page>>;
    fn page_info(&mut self, titles: &[Title]) -> SiteResult<Vec<PageInfo>>;
    fn list_redirects(&mut self, namespaces: &[i32]) -> SiteResult<Vec<Title>>;
    fn request_count(&self) -> usize;
}

pub trait WikiWrite: WikiRead {
    fn save_page(&mut self, page: &Page, summary: &str, minor: bool) -> SiteResult<()>;
    fn move_page(&mut self, from: &Title, to: &Title, options: &MoveOptions) -> SiteResult<()>;
    fn purge(&mut self, titles: &[Title], method: PurgeMethod) -> SiteResult<()>;
}
