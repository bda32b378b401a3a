use super::{Decoder, Settings};
use crate::context::Imaging;
use crate::download::{DownloadEvent, DownloadRequest, download_channel};
use crate::error::{ImagingError, ImagingResult};
use crate::events::DecoderEvent;
use crate::frame::{FrameBinding, FrameSource};
use crate::native::BackingStream;
use crate::sync::lock;
use imaging_types::CreateOptions;
use once_cell::sync::OnceCell;
use shared::{DownloadState, DownloadTransition};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

#[derive(Default)]
struct LateState {
    download: DownloadState,
    bytes: Option<Arc<[u8]>>,
    failure: Option<Arc<ImagingError>>,
}

/// Download side of a decoder created for a network URI or a non-seekable stream.
///
/// Download events are only consumed on the thread that created the decoder, when
/// one of its accessors runs. Until the bytes arrive the decoder exposes a single
/// placeholder frame; afterwards everything forwards to the real decoder. A failed
/// download exposes no frames.
pub(super) struct LateBound {
    owner: ThreadId,
    receiver: Mutex<UnboundedReceiver<DownloadEvent>>,
    state: Mutex<LateState>,
    real: OnceCell<Decoder>,
    placeholder: OnceCell<FrameSource>,
    building: AtomicBool,
}

impl LateBound {
    pub(super) fn start(imaging: &Imaging, request: DownloadRequest) -> Self {
        let (sender, receiver) = download_channel();
        imaging.downloader().begin_download(request, sender);
        Self {
            owner: thread::current().id(),
            receiver: Mutex::new(receiver),
            state: Mutex::new(LateState::default()),
            real: OnceCell::new(),
            placeholder: OnceCell::new(),
            building: AtomicBool::new(false),
        }
    }

    fn verify_access(&self) -> ImagingResult<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(ImagingError::InvalidOperation(
                "a downloading decoder can only be used from the thread that created it".into(),
            ))
        }
    }

    pub(super) fn state(&self) -> DownloadState {
        lock(&self.state).download.clone()
    }

    pub(super) fn failure(&self) -> Option<Arc<ImagingError>> {
        lock(&self.state).failure.clone()
    }

    /// Applies queued download events, then builds the real decoder if the bytes are
    /// in and creation was delayed.
    pub(super) fn resolve(&self, decoder: &Decoder) -> ImagingResult<()> {
        self.verify_access()?;
        if self.building.load(Ordering::Acquire) {
            return Ok(());
        }
        self.pump(decoder);

        let pending = {
            let state = lock(&self.state);
            state.download.is_completed() && state.bytes.is_some()
        };
        if pending && self.real.get().is_none() {
            self.build_real(decoder);
        }
        Ok(())
    }

    fn pump(&self, decoder: &Decoder) {
        loop {
            let next = lock(&self.receiver).try_recv();
            match next {
                Ok(event) => self.apply(decoder, event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state().is_downloading() {
                        self.fail(
                            decoder,
                            ImagingError::Network("download ended without a result".into()),
                        );
                    }
                    break;
                }
            }
        }
    }

    /// Blocks on the event channel until the download reaches a terminal state.
    pub(super) fn wait(&self, decoder: &Decoder) -> ImagingResult<DownloadState> {
        self.verify_access()?;
        while self.state().is_downloading() {
            let next = lock(&self.receiver).blocking_recv();
            match next {
                Some(event) => self.apply(decoder, event),
                None => self.fail(
                    decoder,
                    ImagingError::Network("download ended without a result".into()),
                ),
            }
        }
        self.resolve(decoder)?;
        Ok(self.state())
    }

    fn apply(&self, decoder: &Decoder, event: DownloadEvent) {
        match event {
            DownloadEvent::Progress(percent) => {
                let mut state = lock(&self.state);
                if !state.download.is_downloading() {
                    return;
                }
                let download = std::mem::take(&mut state.download);
                state.download = DownloadTransition::Progress(percent).apply_to_state(download);
                drop(state);
                decoder
                    .inner
                    .events
                    .emit(DecoderEvent::DownloadProgress(percent));
            }
            DownloadEvent::Completed(bytes) => {
                {
                    let mut state = lock(&self.state);
                    if !state.download.is_downloading() {
                        return;
                    }
                    tracing::info!(identity = %decoder.inner.identity, bytes = bytes.len(), "download completed");
                    state.bytes = Some(bytes);
                    let download = std::mem::take(&mut state.download);
                    state.download = DownloadTransition::Completed.apply_to_state(download);
                }
                if !decoder
                    .inner
                    .create_options
                    .contains(CreateOptions::DELAY_CREATION)
                {
                    self.build_real(decoder);
                }
                if self.state().is_completed() {
                    decoder.inner.events.emit(DecoderEvent::DownloadCompleted);
                }
            }
            DownloadEvent::Failed(error) => self.fail(decoder, error),
        }
    }

    fn fail(&self, decoder: &Decoder, error: ImagingError) {
        tracing::warn!(identity = %decoder.inner.identity, "download failed: {}", error);
        let failure = Arc::new(error);
        {
            let mut state = lock(&self.state);
            state.download = DownloadState::Failed(failure.to_string());
            state.bytes = None;
            state.failure = Some(failure.clone());
        }
        decoder
            .inner
            .events
            .emit(DecoderEvent::DownloadFailed(failure));
    }

    /// Opens the downloaded bytes and splices any handed-out placeholder into the
    /// real frame list. A decode failure leaves the decoder permanently failed.
    fn build_real(&self, decoder: &Decoder) {
        let Some(bytes) = lock(&self.state).bytes.clone() else {
            return;
        };
        let inner = &decoder.inner;
        let settings = Settings {
            create_options: inner.create_options,
            cache_option: inner.cache_option,
            expected_format: inner.expected_format,
        };

        self.building.store(true, Ordering::Release);
        let result = self.real.get_or_try_init(|| {
            let stream = BackingStream::from_bytes(bytes, inner.identity.to_string());
            let adopted = self.placeholder.get().cloned().into_iter().collect();
            let real = Decoder::open_container(
                &inner.imaging,
                inner.identity.clone(),
                stream,
                &settings,
                adopted,
            )?;
            real.frames()?;
            Ok::<_, ImagingError>(real)
        });
        self.building.store(false, Ordering::Release);

        match result {
            Ok(_) => tracing::debug!(identity = %inner.identity, "late-bound decoder is now real"),
            Err(err) => self.fail(decoder, err),
        }
    }

    pub(super) fn real(&self, decoder: &Decoder) -> ImagingResult<Option<Decoder>> {
        self.resolve(decoder)?;
        Ok(self.real.get().cloned())
    }

    pub(super) fn frames(&self, decoder: &Decoder) -> ImagingResult<Vec<FrameSource>> {
        if let Some(real) = self.real(decoder)? {
            return real.frames();
        }
        if self.state().is_failed() {
            return Ok(Vec::new());
        }
        Ok(vec![self.placeholder(decoder).clone()])
    }

    fn placeholder(&self, decoder: &Decoder) -> &FrameSource {
        self.placeholder.get_or_init(|| {
            FrameSource::new(
                decoder.inner.imaging.clone(),
                FrameBinding::Placeholder {
                    decoder: decoder.downgrade(),
                },
                decoder.inner.create_options,
                decoder.inner.cache_option,
            )
        })
    }
}
