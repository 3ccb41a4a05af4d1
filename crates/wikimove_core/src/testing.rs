//! In-memory site used by unit tests across the crate.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{SiteError, SiteResult};
use crate::local::{IndexEntry, LinkKind};
use crate::site::{BacklinkKind, MoveOptions, Page, PageInfo, PurgeMethod, WikiRead, WikiWrite};
use crate::title::{NamespaceTable, Title};

pub(crate) fn title(value: &str) -> Title {
    Title::parse(value, &NamespaceTable::standard()).expect("title")
}

#[derive(Default)]
pub(crate) struct MockSite {
    pub namespaces: NamespaceTable,
    pub pages: BTreeMap<Title, String>,
    /// Saves of these titles fail with an edit conflict this many more times.
    pub conflicts: BTreeMap<Title, usize>,
    pub failing_loads: BTreeSet<Title>,
    pub failing_saves: BTreeSet<Title>,
    pub saved: Vec<(Title, String)>,
    pub moved: Vec<(Title, Title)>,
    pub purged: Vec<Title>,
    pub request_count: usize,
}

impl MockSite {
    pub(crate) fn with_pages(pages: &[(&str, &str)]) -> Self {
        let mut site = Self::default();
        for (name, text) in pages {
            site.pages.insert(title(name), (*text).to_string());
        }
        site
    }

    pub(crate) fn text(&self, name: &str) -> Option<&str> {
        self.pages.get(&title(name)).map(String::as_str)
    }

    pub(crate) fn saved_titles(&self) -> BTreeSet<Title> {
        self.saved.iter().map(|(title, _)| title.clone()).collect()
    }

    fn sources_for(&self, target: &Title, kind: LinkKind) -> Vec<Title> {
        self.pages
            .iter()
            .filter(|(source, text)| {
                IndexEntry::build(source, text, &self.namespaces)
                    .links
                    .contains(&(kind, target.without_fragment()))
            })
            .map(|(source, _)| source.clone())
            .collect()
    }
}

impl WikiRead for MockSite {
    fn backlinks(&mut self, title: &Title, kinds: &[BacklinkKind]) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        let mut found = BTreeSet::new();
        for kind in kinds {
            found.extend(self.sources_for(title, LinkKind::Backlink(*kind)));
        }
        Ok(found.into_iter().collect())
    }

    fn category_members(&mut self, category: &Title) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        Ok(self.sources_for(category, LinkKind::Category))
    }

    fn load_pages(&mut self, titles: &[Title]) -> SiteResult<Vec<Page>> {
        self.request_count += 1;
        if titles.iter().any(|title| self.failing_loads.contains(title)) {
            return Err(SiteError::Http { status: 500 });
        }
        Ok(titles
            .iter()
            .map(|title| match self.pages.get(title) {
                Some(text) => {
                    let mut page = Page::new(title.without_fragment(), text.clone());
                    page.base_hash = Some(crate::local::compute_hash(text));
                    page
                }
                None => Page::missing(title.without_fragment()),
            })
            .collect())
    }

    fn page_info(&mut self, titles: &[Title]) -> SiteResult<Vec<PageInfo>> {
        self.request_count += 1;
        Ok(titles
            .iter()
            .map(|title| match self.pages.get(title) {
                Some(text) => {
                    let entry = IndexEntry::build(title, text, &self.namespaces);
                    PageInfo {
                        title: title.without_fragment(),
                        exists: true,
                        redirect_target: entry.redirect_target,
                        disambiguation: text.contains("__DISAMBIG__"),
                        categories: entry.categories,
                    }
                }
                None => PageInfo::missing(title.without_fragment()),
            })
            .collect())
    }

    fn list_redirects(&mut self, namespaces: &[i32]) -> SiteResult<Vec<Title>> {
        self.request_count += 1;
        Ok(self
            .pages
            .iter()
            .filter(|(title, text)| {
                namespaces.contains(&title.namespace())
                    && crate::wikitext::redirect_target(text).is_some()
            })
            .map(|(title, _)| title.clone())
            .collect())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWrite for MockSite {
    fn save_page(&mut self, page: &Page, _summary: &str, _minor: bool) -> SiteResult<()> {
        self.request_count += 1;
        if let Some(remaining) = self.conflicts.get_mut(&page.title)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(SiteError::EditConflict {
                title: page.title.full_name(),
            });
        }
        if self.failing_saves.contains(&page.title) {
            return Err(SiteError::Api {
                code: "protectedpage".to_string(),
                info: "This page has been protected".to_string(),
            });
        }
        self.pages.insert(page.title.clone(), page.text.clone());
        self.saved.push((page.title.clone(), page.text.clone()));
        Ok(())
    }

    fn move_page(&mut self, from: &Title, to: &Title, options: &MoveOptions) -> SiteResult<()> {
        self.request_count += 1;
        if self.pages.contains_key(to) {
            return Err(SiteError::Api {
                code: "articleexists".to_string(),
                info: format!("{} already exists", to.full_name()),
            });
        }
        let text = self.pages.remove(from).ok_or_else(|| SiteError::MissingPage {
            title: from.full_name(),
        })?;
        self.pages.insert(to.clone(), text);
        if options.leave_redirect {
            self.pages
                .insert(from.clone(), format!("#REDIRECT [[{}]]", to.full_name()));
        }
        self.moved.push((from.clone(), to.clone()));
        Ok(())
    }

    fn purge(&mut self, titles: &[Title], _method: PurgeMethod) -> SiteResult<()> {
        self.request_count += 1;
        self.purged.extend(titles.iter().cloned());
        Ok(())
    }
}
