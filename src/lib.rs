pub mod blocks;
pub mod browser;
pub mod dom;
pub mod images;
pub mod pagination;
pub mod scheduler;
pub mod scrape;
pub mod settings;
pub mod store;
pub mod tagger;

pub use blocks::{AttrValue, Block, FindOptions, find_blocks, find_new_blocks};
pub use browser::{BrowserSettings, Driver, PageHandle};
pub use dom::{CleanerSettings, TagTree, clean_html};
pub use images::{BlobStore, ImageContext, RecordImage};
pub use pagination::{HandlerKind, PaginationSettings};
pub use scheduler::{RetryQueue, SchedulerState, run_scheduler};
pub use scrape::{ScrapeContext, ScrapeDeps, ScrapeError, StopFlag, TerminalKind};
pub use settings::{
    AttributeRule, Batch, CatalogSettings, Env, Proxy, ScrapeTask, ScraperKind, SettingsStore,
    TableCache, TaskConfig, VdpSettings,
};
pub use store::{DetailRecord, Record, Store};
pub use tagger::{Annotations, tag_values};
