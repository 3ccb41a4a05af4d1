use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::WikiConfig;
use crate::error::{SiteError, SiteResult};
use crate::site::{BacklinkKind, MoveOptions, Page, PageInfo, PurgeMethod, WikiRead, WikiWrite};
use crate::title::{NamespaceTable, Title};

const TITLES_PER_REQUEST: usize = 50;
const LIST_LIMIT: &str = "500";

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &WikiConfig) -> Self {
        let api_default = config.wiki.api_url.as_deref().unwrap_or("");
        Self::from_env_with_defaults(api_default, &config.user_agent())
    }

    fn from_env_with_defaults(api_url_default: &str, user_agent_default: &str) -> Self {
        Self {
            api_url: env_value("WIKI_API_URL", api_url_default),
            user_agent: env_value("WIKI_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

/// Site collaborator speaking the MediaWiki action API.
pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    namespaces: NamespaceTable,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn from_config(config: &WikiConfig) -> Result<Self> {
        Self::new(
            MediaWikiClientConfig::from_config(config),
            config.namespace_table(),
        )
    }

    pub fn new(config: MediaWikiClientConfig, namespaces: NamespaceTable) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            bail!("wiki API URL is not configured (set WIKI_API_URL or [wiki].api_url)");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            namespaces,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                debug!(user = username, "logged in");
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> SiteResult<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;
        let pairs = request_pairs(params);

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        return Err(SiteError::Http {
                            status: status.as_u16(),
                        });
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    return check_api_error(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(anyhow::Error::new(error)
                        .context("failed to call MediaWiki API")
                        .into());
                }
            }
        }

        Err(anyhow::anyhow!("MediaWiki API request exhausted retry budget").into())
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> SiteResult<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let pairs = request_pairs(params);

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        return Err(SiteError::Http {
                            status: status.as_u16(),
                        });
                    }
                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    return check_api_error(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(anyhow::Error::new(error)
                        .context("failed to call MediaWiki API")
                        .into());
                }
            }
        }

        Err(anyhow::anyhow!("MediaWiki API request exhausted retry budget").into())
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        let wait = base.saturating_mul(multiplier).saturating_add(jitter);
        debug!(attempt, wait_ms = wait, "retrying MediaWiki request");
        sleep(Duration::from_millis(wait));
    }

    fn ensure_csrf_token(&mut self) -> SiteResult<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// Follows `continue` until a `list=` query is exhausted.
    fn list_titles(
        &mut self,
        list: &str,
        prefix: &str,
        filters: &[(&str, String)],
    ) -> SiteResult<Vec<String>> {
        let limit_key = format!("{prefix}limit");
        let continue_key = format!("{prefix}continue");
        let mut titles = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("list", list.to_string()),
                (limit_key.as_str(), LIST_LIMIT.to_string()),
            ];
            params.extend(filters.iter().cloned());
            if let Some(token) = &continue_token {
                params.push((continue_key.as_str(), token.clone()));
            }

            let response = self.request_json_get(&params)?;
            titles.extend(titles_in_list(&response, list)?);
            continue_token = continuation_token(&response, &continue_key);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(titles)
    }

    fn parse_titles(&self, values: Vec<String>) -> SiteResult<Vec<Title>> {
        values
            .iter()
            .map(|value| parse_api_title(value, &self.namespaces))
            .collect()
    }

    fn redirect_targets(&mut self, titles: &[Title]) -> SiteResult<BTreeMap<Title, Title>> {
        let mut targets = BTreeMap::new();
        for batch in titles.chunks(TITLES_PER_REQUEST) {
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", join_titles(batch)),
                ("redirects", "1".to_string()),
            ])?;
            targets.extend(decode_redirect_targets(&response, &self.namespaces)?);
        }
        Ok(targets)
    }
}

impl WikiRead for MediaWikiClient {
    fn backlinks(&mut self, title: &Title, kinds: &[BacklinkKind]) -> SiteResult<Vec<Title>> {
        let target = title.full_name();
        let mut found = BTreeSet::new();
        for kind in kinds {
            let values = match kind {
                BacklinkKind::Link => self.list_titles(
                    "backlinks",
                    "bl",
                    &[
                        ("bltitle", target.clone()),
                        ("blfilterredir", "nonredirects".to_string()),
                    ],
                )?,
                BacklinkKind::Redirect => self.list_titles(
                    "backlinks",
                    "bl",
                    &[
                        ("bltitle", target.clone()),
                        ("blfilterredir", "redirects".to_string()),
                    ],
                )?,
                BacklinkKind::Transclusion => {
                    self.list_titles("embeddedin", "ei", &[("eititle", target.clone())])?
                }
                BacklinkKind::FileUsage => {
                    if !title.is_file() {
                        continue;
                    }
                    self.list_titles("imageusage", "iu", &[("iutitle", target.clone())])?
                }
            };
            found.extend(self.parse_titles(values)?);
        }
        debug!(title = %title, count = found.len(), "fetched backlinks");
        Ok(found.into_iter().collect())
    }

    fn category_members(&mut self, category: &Title) -> SiteResult<Vec<Title>> {
        let values = self.list_titles(
            "categorymembers",
            "cm",
            &[("cmtitle", category.full_name())],
        )?;
        self.parse_titles(values)
    }

    fn load_pages(&mut self, titles: &[Title]) -> SiteResult<Vec<Page>> {
        let mut loaded = BTreeMap::new();
        for batch in titles.chunks(TITLES_PER_REQUEST) {
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", join_titles(batch)),
                ("prop", "revisions".to_string()),
                ("rvprop", "content|timestamp|ids".to_string()),
                ("rvslots", "main".to_string()),
            ])?;
            loaded.extend(decode_revisions(&response, &self.namespaces)?);
        }
        Ok(titles
            .iter()
            .map(|title| {
                loaded
                    .get(title)
                    .cloned()
                    .unwrap_or_else(|| Page::missing(title.without_fragment()))
            })
            .collect())
    }

    fn page_info(&mut self, titles: &[Title]) -> SiteResult<Vec<PageInfo>> {
        let mut infos = BTreeMap::new();
        for batch in titles.chunks(TITLES_PER_REQUEST) {
            let response = self.request_json_get(&[
                ("action", "query".to_string()),
                ("titles", join_titles(batch)),
                ("prop", "info|categories|pageprops".to_string()),
                ("ppprop", "disambiguation".to_string()),
                ("cllimit", "max".to_string()),
            ])?;
            infos.extend(decode_page_infos(&response, &self.namespaces)?);
        }

        let redirects: Vec<Title> = infos
            .iter()
            .filter(|(_, (_, is_redirect))| *is_redirect)
            .map(|(title, _)| title.clone())
            .collect();
        let targets = if redirects.is_empty() {
            BTreeMap::new()
        } else {
            self.redirect_targets(&redirects)?
        };

        Ok(titles
            .iter()
            .map(|title| match infos.get(title) {
                Some((info, _)) => {
                    let mut info = info.clone();
                    info.redirect_target = targets.get(title).cloned();
                    info
                }
                None => PageInfo::missing(title.without_fragment()),
            })
            .collect())
    }

    fn list_redirects(&mut self, namespaces: &[i32]) -> SiteResult<Vec<Title>> {
        let mut out = Vec::new();
        for namespace in namespaces {
            let values = self.list_titles(
                "allpages",
                "ap",
                &[
                    ("apnamespace", namespace.to_string()),
                    ("apfilterredir", "redirects".to_string()),
                ],
            )?;
            out.extend(self.parse_titles(values)?);
        }
        Ok(out)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWrite for MediaWikiClient {
    fn save_page(&mut self, page: &Page, summary: &str, minor: bool) -> SiteResult<()> {
        let token = self.ensure_csrf_token()?;
        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", page.title.full_name()),
            ("text", page.text.clone()),
            ("summary", summary.to_string()),
            ("bot", "1".to_string()),
            (if minor { "minor" } else { "notminor" }, "1".to_string()),
            ("token", token),
        ];
        if page.exists {
            params.push(("nocreate", "1".to_string()));
        } else {
            params.push(("createonly", "1".to_string()));
        }
        if let Some(timestamp) = &page.timestamp {
            params.push(("basetimestamp", timestamp.clone()));
        }
        if let Some(revision) = page.revision_id {
            params.push(("baserevid", revision.to_string()));
        }

        let response = self
            .request_json_post(&params, true)
            .map_err(|error| match error {
                // createonly refused: someone created the page after it was loaded
                SiteError::Api { code, .. } if code == "articleexists" => SiteError::EditConflict {
                    title: page.title.full_name(),
                },
                other => classify_page_error(other, &page.title),
            })?;
        let payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let edit = payload
            .edit
            .ok_or_else(|| anyhow::anyhow!("missing edit payload in API response"))?;
        if edit.result.as_deref() != Some("Success") {
            return Err(SiteError::Api {
                code: "editfailed".to_string(),
                info: format!(
                    "edit of {} returned {}",
                    page.title,
                    edit.result.unwrap_or_else(|| "unknown".to_string())
                ),
            });
        }
        Ok(())
    }

    fn move_page(&mut self, from: &Title, to: &Title, options: &MoveOptions) -> SiteResult<()> {
        let token = self.ensure_csrf_token()?;
        let mut params = vec![
            ("action", "move".to_string()),
            ("from", from.full_name()),
            ("to", to.full_name()),
            ("reason", options.reason.clone()),
            ("token", token),
        ];
        if !options.leave_redirect {
            params.push(("noredirect", "1".to_string()));
        }
        if options.move_talk {
            params.push(("movetalk", "1".to_string()));
        }
        if options.move_subpages {
            params.push(("movesubpages", "1".to_string()));
        }
        self.request_json_post(&params, true)
            .map_err(|error| classify_page_error(error, from))?;
        Ok(())
    }

    fn purge(&mut self, titles: &[Title], method: PurgeMethod) -> SiteResult<()> {
        for batch in titles.chunks(TITLES_PER_REQUEST) {
            let mut params = vec![
                ("action", "purge".to_string()),
                ("titles", join_titles(batch)),
            ];
            match method {
                PurgeMethod::Purge => {}
                PurgeMethod::ForceLinkUpdate => params.push(("forcelinkupdate", "1".to_string())),
                PurgeMethod::ForceRecursiveLinkUpdate => {
                    params.push(("forcerecursivelinkupdate", "1".to_string()))
                }
            }
            if let Err(error) = self.request_json_post(&params, false) {
                warn!(%error, count = batch.len(), "purge failed");
                return Err(error);
            }
        }
        Ok(())
    }
}

fn request_pairs(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

fn check_api_error(payload: Value) -> SiteResult<Value> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(SiteError::Api {
            code: code.to_string(),
            info: info.to_string(),
        });
    }
    Ok(payload)
}

/// Maps page-scoped API error codes onto the typed variants the engine retries on.
fn classify_page_error(error: SiteError, title: &Title) -> SiteError {
    match error {
        SiteError::Api { code, .. } if code == "editconflict" => SiteError::EditConflict {
            title: title.full_name(),
        },
        SiteError::Api { code, .. } if code == "missingtitle" || code == "pagedeleted" => {
            SiteError::MissingPage {
                title: title.full_name(),
            }
        }
        SiteError::Api { code, .. } if code == "nosuchrevid" => SiteError::MissingRevision {
            title: title.full_name(),
        },
        other => other,
    }
}

fn continuation_token(payload: &Value, key: &str) -> Option<String> {
    payload
        .get("continue")
        .and_then(|cont| cont.get(key))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn titles_in_list(payload: &Value, list: &str) -> SiteResult<Vec<String>> {
    let Some(items) = payload.get("query").and_then(|query| query.get(list)) else {
        return Ok(Vec::new());
    };
    let items: Vec<TitleQueryItem> = serde_json::from_value(items.clone())
        .with_context(|| format!("failed to decode {list} API response"))?;
    Ok(items.into_iter().map(|item| item.title).collect())
}

fn decode_revisions(payload: &Value, namespaces: &NamespaceTable) -> SiteResult<BTreeMap<Title, Page>> {
    let parsed: QueryResponse = serde_json::from_value(payload.clone())
        .context("failed to decode page content API response")?;
    let mut out = BTreeMap::new();
    for item in parsed.query.pages {
        let title = parse_api_title(&item.title, namespaces)?;
        let content = item.revisions.first().and_then(|revision| {
            revision
                .slots
                .as_ref()
                .and_then(|slots| slots.main.as_ref())
                .map(|slot| (revision, slot.content.clone()))
        });
        let page = match (item.missing.unwrap_or(false), content) {
            (false, Some((revision, text))) => {
                let mut page = Page::new(title.clone(), text);
                page.revision_id = Some(revision.revid);
                page.timestamp = Some(revision.timestamp.clone());
                page
            }
            _ => Page::missing(title.clone()),
        };
        out.insert(title, page);
    }
    Ok(out)
}

/// Page info keyed by title, plus the API's redirect flag for each page.
fn decode_page_infos(
    payload: &Value,
    namespaces: &NamespaceTable,
) -> SiteResult<BTreeMap<Title, (PageInfo, bool)>> {
    let parsed: QueryResponse = serde_json::from_value(payload.clone())
        .context("failed to decode page info API response")?;
    let mut out = BTreeMap::new();
    for item in parsed.query.pages {
        let title = parse_api_title(&item.title, namespaces)?;
        if item.missing.unwrap_or(false) || item.invalid.unwrap_or(false) {
            out.insert(title.clone(), (PageInfo::missing(title), false));
            continue;
        }
        let categories = item
            .categories
            .iter()
            .map(|category| parse_api_title(&category.title, namespaces))
            .collect::<SiteResult<Vec<_>>>()?;
        let disambiguation = item
            .pageprops
            .as_ref()
            .is_some_and(|props| props.get("disambiguation").is_some());
        let info = PageInfo {
            title: title.clone(),
            exists: true,
            redirect_target: None,
            disambiguation,
            categories,
        };
        out.insert(title, (info, item.redirect.unwrap_or(false)));
    }
    Ok(out)
}

fn decode_redirect_targets(
    payload: &Value,
    namespaces: &NamespaceTable,
) -> SiteResult<BTreeMap<Title, Title>> {
    let parsed: QueryResponse = serde_json::from_value(payload.clone())
        .context("failed to decode redirect API response")?;
    let mut out = BTreeMap::new();
    for item in parsed.query.redirects {
        let from = parse_api_title(&item.from, namespaces)?;
        let to = parse_api_title(&item.to, namespaces)?;
        out.insert(from, to.with_fragment(item.tofragment.as_deref()));
    }
    Ok(out)
}

fn parse_api_title(value: &str, namespaces: &NamespaceTable) -> SiteResult<Title> {
    Title::parse(value, namespaces)
        .with_context(|| format!("API returned malformed title {value:?}"))
        .map_err(SiteError::from)
}

fn join_titles(batch: &[Title]) -> String {
    batch
        .iter()
        .map(Title::full_name)
        .collect::<Vec<_>>()
        .join("|")
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
    #[serde(default)]
    redirects: Vec<RedirectQueryItem>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    title: String,
    missing: Option<bool>,
    invalid: Option<bool>,
    redirect: Option<bool>,
    #[serde(default)]
    categories: Vec<TitleQueryItem>,
    pageprops: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    revisions: Vec<RevisionQueryItem>,
}

#[derive(Debug, Deserialize)]
struct RedirectQueryItem {
    from: String,
    to: String,
    tofragment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionQueryItem {
    revid: i64,
    timestamp: String,
    slots: Option<RevisionSlotContainer>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlotContainer {
    main: Option<RevisionMainSlot>,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EditResponse {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EditPayload {
    result: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn table() -> NamespaceTable {
        NamespaceTable::standard()
    }

    fn title(value: &str) -> Title {
        Title::parse(value, &table()).expect("title")
    }

    #[test]
    fn api_errors_become_typed_site_errors() {
        let error = check_api_error(json!({"error": {"code": "editconflict", "info": "Edit conflict."}}))
            .expect_err("api error");
        let classified = classify_page_error(error, &title("Alpha"));
        assert!(matches!(classified, SiteError::EditConflict { ref title } if title == "Alpha"));
        assert!(classified.is_transient());

        let missing = classify_page_error(
            SiteError::Api {
                code: "missingtitle".to_string(),
                info: "gone".to_string(),
            },
            &title("Alpha"),
        );
        assert!(matches!(missing, SiteError::MissingPage { .. }));

        let revision = classify_page_error(
            SiteError::Api {
                code: "nosuchrevid".to_string(),
                info: "no".to_string(),
            },
            &title("Alpha"),
        );
        assert!(matches!(revision, SiteError::MissingRevision { .. }));

        let other = classify_page_error(SiteError::Http { status: 503 }, &title("Alpha"));
        assert!(matches!(other, SiteError::Http { status: 503 }));
    }

    #[test]
    fn list_payloads_and_continuation() {
        let payload = json!({
            "continue": {"blcontinue": "0|123", "continue": "-||"},
            "query": {"backlinks": [{"pageid": 1, "ns": 0, "title": "Alpha"}, {"pageid": 2, "ns": 0, "title": "Beta"}]}
        });
        assert_eq!(
            titles_in_list(&payload, "backlinks").expect("titles"),
            vec!["Alpha".to_string(), "Beta".to_string()]
        );
        assert_eq!(continuation_token(&payload, "blcontinue").as_deref(), Some("0|123"));
        assert!(continuation_token(&payload, "eicontinue").is_none());
        assert!(titles_in_list(&json!({"batchcomplete": true}), "embeddedin")
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn revisions_decode_into_pages() {
        let payload = json!({
            "query": {"pages": [
                {"pageid": 7, "ns": 0, "title": "Alpha", "revisions": [
                    {"revid": 42, "parentid": 41, "timestamp": "2026-01-02T03:04:05Z",
                     "slots": {"main": {"contentmodel": "wikitext", "content": "[[Old]]"}}}
                ]},
                {"ns": 0, "title": "Missing page", "missing": true}
            ]}
        });
        let pages = decode_revisions(&payload, &table()).expect("pages");
        let alpha = &pages[&title("Alpha")];
        assert!(alpha.exists);
        assert_eq!(alpha.text, "[[Old]]");
        assert_eq!(alpha.revision_id, Some(42));
        assert_eq!(alpha.timestamp.as_deref(), Some("2026-01-02T03:04:05Z"));
        assert!(!pages[&title("Missing page")].exists);
    }

    #[test]
    fn page_info_reads_flags_and_categories() {
        let payload = json!({
            "query": {"pages": [
                {"pageid": 1, "ns": 0, "title": "Mercury", "pageprops": {"disambiguation": ""},
                 "categories": [{"ns": 14, "title": "Category:Disambiguation pages"}]},
                {"pageid": 2, "ns": 0, "title": "Old Bar", "redirect": true},
                {"ns": 0, "title": "Nothing", "missing": true}
            ]}
        });
        let infos = decode_page_infos(&payload, &table()).expect("infos");
        let (mercury, mercury_redirect) = &infos[&title("Mercury")];
        assert!(mercury.disambiguation);
        assert!(!mercury_redirect);
        assert_eq!(mercury.categories, vec![title("Category:Disambiguation pages")]);
        assert!(infos[&title("Old Bar")].1);
        assert!(!infos[&title("Nothing")].0.exists);
    }

    #[test]
    fn redirect_targets_keep_fragments() {
        let payload = json!({
            "query": {
                "redirects": [{"from": "Old Bar", "to": "New Bar", "tofragment": "History"}],
                "pages": [{"pageid": 3, "ns": 0, "title": "New Bar"}]
            }
        });
        let targets = decode_redirect_targets(&payload, &table()).expect("targets");
        let target = &targets[&title("Old Bar")];
        assert_eq!(target, &title("New Bar"));
        assert_eq!(target.fragment(), Some("History"));
    }

    #[test]
    fn request_pairs_skip_empty_values() {
        let pairs = request_pairs(&[("action", "query".to_string()), ("reason", String::new())]);
        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(key, _)| key != "reason"));
    }
}
