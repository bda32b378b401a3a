use crate::decoder::{Decoder, DecoderCache};
use crate::download::{DefaultDownloader, Downloader};
use crate::engine::{CodecEngine, ImageEngine};
use crate::error::ImagingResult;
use crate::identity::BitmapSource;
use imaging_config::EngineConfig;
use imaging_types::{CacheOption, CreateOptions};
use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;

static GLOBAL: Lazy<Imaging> = Lazy::new(|| {
    let config = EngineConfig::from_env();
    Imaging::builder(ImageEngine::from_config(&config))
        .config(config)
        .build()
});

struct ImagingInner {
    engine: Arc<dyn CodecEngine>,
    downloader: Arc<dyn Downloader>,
    cache: DecoderCache,
    config: EngineConfig,
}

/// Everything a decoder needs from its surroundings: the codec engine, the weak
/// decoder cache, the downloader and configuration. Cheap to clone.
#[derive(Clone)]
pub struct Imaging {
    inner: Arc<ImagingInner>,
}

impl Imaging {
    pub fn new(engine: impl CodecEngine) -> Self {
        Self::builder(engine).build()
    }

    pub fn builder(engine: impl CodecEngine) -> ImagingBuilder {
        ImagingBuilder {
            engine: Arc::new(engine),
            downloader: None,
            config: EngineConfig::default(),
        }
    }

    /// Process-wide context backed by [`ImageEngine`], configured from `IMAGING_*`
    /// environment variables on first use.
    pub fn global() -> &'static Imaging {
        &GLOBAL
    }

    pub fn engine(&self) -> &dyn CodecEngine {
        self.inner.engine.as_ref()
    }

    pub fn downloader(&self) -> &dyn Downloader {
        self.inner.downloader.as_ref()
    }

    pub fn decoder_cache(&self) -> &DecoderCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn create_decoder(
        &self,
        source: impl Into<BitmapSource>,
        create_options: CreateOptions,
        cache_option: CacheOption,
    ) -> ImagingResult<Decoder> {
        Decoder::create_in(self, source, create_options, cache_option)
    }

    pub fn ptr_eq(&self, other: &Imaging) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Imaging {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Imaging")
            .field("engine", &self.inner.engine.name())
            .field("cached_decoders", &self.inner.cache.len())
            .finish()
    }
}

pub struct ImagingBuilder {
    engine: Arc<dyn CodecEngine>,
    downloader: Option<Arc<dyn Downloader>>,
    config: EngineConfig,
}

impl ImagingBuilder {
    pub fn downloader(mut self, downloader: impl Downloader + 'static) -> Self {
        self.downloader = Some(Arc::new(downloader));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Imaging {
        let downloader = self.downloader.unwrap_or_else(|| {
            Arc::new(DefaultDownloader::new(
                self.config.stream_chunk_size,
                self.config.user_agent.clone(),
            ))
        });
        Imaging {
            inner: Arc::new(ImagingInner {
                engine: self.engine,
                downloader,
                cache: DecoderCache::new(),
                config: self.config,
            }),
        }
    }
}
