pub mod backlinks;
pub mod config;
pub mod engine;
pub mod error;
pub mod followup;
pub mod jobs;
pub mod local;
pub mod mediawiki;
pub mod redirects;
pub mod registry;
pub mod resolver;
pub mod rewrite;
pub mod runtime;
pub mod site;
pub mod state;
pub mod title;
pub mod wikitext;

#[cfg(test)]
mod testing;
