//! Paginated building discovery over the area directory.
//!
//! The crawl is a small state machine. An anti-bot challenge moves it into
//! [`Step::Suspended`], which only an operator confirmation (or giving up) leaves.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rentscan_adapters::{
    area_slug, detect_challenge, directory_url, extract_building_links, parse_total_pages, ChallengeOutcome,
    ChallengeResolver, SessionProvider,
};
use rentscan_core::{BuildingRecord, BuildingRegistry, RunPhase, RunProgress, RunState, RunStatus};
use rentscan_storage::StopSignal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::ProgressReporter;

/// Waits for an operator to clear a challenge in the browser. Each confirmation bumps
/// the generation counter behind the watch channel.
#[derive(Debug, Clone)]
pub struct OperatorGate {
    confirmations: watch::Receiver<u64>,
    timeout: Duration,
}

impl OperatorGate {
    pub fn channel(timeout: Duration) -> (watch::Sender<u64>, Self) {
        let (tx, rx) = watch::channel(0);
        (
            tx,
            Self {
                confirmations: rx,
                timeout,
            },
        )
    }
}

#[async_trait]
impl ChallengeResolver for OperatorGate {
    async fn resolve(&self, url: &str) -> ChallengeOutcome {
        if let Err(err) = std::io::stderr().write_all(b"\x07\x07\x07\x07\x07") {
            debug!(error = %err, "could not ring terminal bell");
        }
        warn!(
            url,
            timeout_secs = self.timeout.as_secs(),
            "anti-bot challenge detected; solve it in the browser session, then press Enter"
        );
        let mut rx = self.confirmations.clone();
        let _ = rx.borrow_and_update();
        match tokio::time::timeout(self.timeout, rx.changed()).await {
            Ok(Ok(())) => {
                info!(url, "operator confirmed challenge resolved");
                ChallengeOutcome::Resolved
            }
            Ok(Err(_)) => {
                warn!(url, "confirmation channel closed, abandoning discovery");
                ChallengeOutcome::Abandoned
            }
            Err(_) => {
                warn!(url, "no operator confirmation before timeout, abandoning discovery");
                ChallengeOutcome::Abandoned
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEnd {
    Exhausted,
    Stopped,
    Abandoned,
    RequestFailed,
}

#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub registry: BuildingRegistry,
    pub total_pages: usize,
    pub pages_visited: usize,
    pub end: DiscoveryEnd,
}

#[derive(Debug)]
enum Step {
    Fetch { page: usize },
    Suspended { page: usize, url: String },
    Extract { page: usize, html: String },
    Done(DiscoveryEnd),
}

pub struct BuildingCrawler {
    session: Arc<dyn SessionProvider>,
    resolver: Arc<dyn ChallengeResolver>,
    reporter: Arc<dyn ProgressReporter>,
    stop: StopSignal,
    site_url: String,
}

impl BuildingCrawler {
    pub fn new(
        session: Arc<dyn SessionProvider>,
        resolver: Arc<dyn ChallengeResolver>,
        reporter: Arc<dyn ProgressReporter>,
        stop: StopSignal,
        site_url: impl Into<String>,
    ) -> Self {
        Self {
            session,
            resolver,
            reporter,
            stop,
            site_url: site_url.into(),
        }
    }

    fn after_load(page: usize, url: String, html: String) -> Step {
        if detect_challenge(&html) {
            Step::Suspended { page, url }
        } else {
            Step::Extract { page, html }
        }
    }

    async fn publish_pages(&self, current: usize, total: usize, phase: RunPhase, found: usize) {
        let message = match phase {
            RunPhase::CompletedDiscovery => format!("Discovery finished: {found} buildings"),
            _ => format!("Scraping buildings: page {current}/{total} ({found} buildings)"),
        };
        self.reporter
            .publish(
                RunStatus::new(RunState::Running)
                    .with_progress(RunProgress::pages(current, total, phase))
                    .with_message(message),
            )
            .await;
    }

    /// Best effort: returns whatever was registered before the crawl ended, however it ended.
    pub async fn crawl(&self, area: &str) -> DiscoveryReport {
        let slug = area_slug(area);
        let mut registry = BuildingRegistry::new();
        let mut total: Option<usize> = None;
        let mut visited = 0;
        let mut step = Step::Fetch { page: 1 };
        info!(area, slug = %slug, "discovering buildings");

        let end = loop {
            step = match step {
                Step::Done(end) => break end,
                Step::Fetch { page } => {
                    if self.stop.poll().await {
                        info!(page, "stop requested during discovery");
                        Step::Done(DiscoveryEnd::Stopped)
                    } else {
                        let url = directory_url(&self.site_url, &slug, page);
                        match self.session.load_page(&url).await {
                            Ok(html) => Self::after_load(page, url, html),
                            Err(err) => {
                                warn!(page, error = %err, "directory page request failed, ending discovery");
                                Step::Done(DiscoveryEnd::RequestFailed)
                            }
                        }
                    }
                }
                Step::Suspended { page, url } => match self.resolver.resolve(&url).await {
                    ChallengeOutcome::Abandoned => Step::Done(DiscoveryEnd::Abandoned),
                    ChallengeOutcome::Resolved => match self.session.reload_page(&url).await {
                        Ok(html) => Self::after_load(page, url, html),
                        Err(err) => {
                            warn!(page, error = %err, "reload after challenge failed, ending discovery");
                            Step::Done(DiscoveryEnd::RequestFailed)
                        }
                    },
                },
                Step::Extract { page, html } => {
                    let total_pages = match total {
                        Some(n) => n,
                        None => {
                            let n = parse_total_pages(&html).unwrap_or_else(|err| {
                                warn!(error = %err, "pagination unreadable, assuming one page");
                                1
                            });
                            info!(total_pages = n, "directory pagination");
                            self.publish_pages(0, n, RunPhase::ScrapingBuildings, 0).await;
                            total = Some(n);
                            n
                        }
                    };
                    visited += 1;
                    match extract_building_links(&html) {
                        Ok(links) => {
                            let before = registry.len();
                            for link in links {
                                registry.insert(BuildingRecord::discovered(link.slug, Some(link.href), link.address));
                            }
                            debug!(page, added = registry.len() - before, "page extracted");
                        }
                        Err(err) => warn!(page, error = %err, "could not extract buildings, skipping page"),
                    }
                    self.publish_pages(page, total_pages, RunPhase::ScrapingBuildings, registry.len())
                        .await;
                    if page >= total_pages {
                        Step::Done(DiscoveryEnd::Exhausted)
                    } else {
                        Step::Fetch { page: page + 1 }
                    }
                }
            };
        };

        let total_pages = total.unwrap_or(0);
        if end != DiscoveryEnd::Stopped {
            self.publish_pages(total_pages, total_pages, RunPhase::CompletedDiscovery, registry.len())
                .await;
        }
        info!(buildings = registry.len(), pages = visited, ?end, "discovery ended");
        DiscoveryReport {
            registry,
            total_pages,
            pages_visited: visited,
            end,
        }
    }
}
