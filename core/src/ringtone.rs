//! Ringtone controller
//!
//! Plays a synthesised tone pattern while an incoming call rings. At most one
//! pattern is active; starting a new one releases the previous voice first.
//! Every pattern stops on its own after the configured ceiling.

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "audio")]
pub use self::rodio_output::RodioOutput;

/// Opens a voice on the audio device.
pub trait AudioOutput: Send + Sync + 'static {
    fn open(&self) -> Result<Box<dyn ToneVoice>>;
}

/// An open audio voice. Dropping it releases the device resources.
pub trait ToneVoice: Send {
    fn tone(&mut self, frequency_hz: f32, duration: Duration);

    fn silence(&mut self);
}

/// Audio output that plays nothing. Used when no device is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

struct SilentVoice;

impl AudioOutput for SilentOutput {
    fn open(&self) -> Result<Box<dyn ToneVoice>> {
        Ok(Box::new(SilentVoice))
    }
}

impl ToneVoice for SilentVoice {
    fn tone(&mut self, frequency_hz: f32, duration: Duration) {
        tracing::trace!(frequency_hz, ?duration, "ring");
    }

    fn silence(&mut self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct TonePattern {
    pub frequency_hz: f32,
    pub beep: Duration,
    pub beeps: u32,
    pub gap: Duration,
    /// Start-to-start distance of two bursts.
    pub cycle: Duration,
}

impl Default for TonePattern {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            beep: Duration::from_millis(400),
            beeps: 2,
            gap: Duration::from_millis(200),
            cycle: Duration::from_secs(3),
        }
    }
}

struct ToneSession {
    voice: Mutex<Option<Box<dyn ToneVoice>>>,
    cancel: CancellationToken,
}

impl ToneSession {
    fn stop(&self) {
        self.cancel.cancel();
        if let Some(mut voice) = self.voice.lock().take() {
            voice.silence();
        }
    }
}

/// Handle to one playing pattern.
#[derive(Clone)]
pub struct RingtoneHandle {
    session: Arc<ToneSession>,
}

impl RingtoneHandle {
    fn stopped() -> Self {
        let session = ToneSession {
            voice: Mutex::new(None),
            cancel: CancellationToken::new(),
        };
        session.cancel.cancel();
        Self {
            session: Arc::new(session),
        }
    }

    /// Releases the voice synchronously. Idempotent.
    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.session.voice.lock().is_some()
    }
}

#[derive(Clone)]
pub struct Ringtone {
    output: Arc<dyn AudioOutput>,
    pattern: TonePattern,
    ceiling: Duration,
    current: Arc<Mutex<Option<RingtoneHandle>>>,
}

impl Ringtone {
    pub fn new(output: Arc<dyn AudioOutput>, pattern: TonePattern, ceiling: Duration) -> Self {
        Self {
            output,
            pattern,
            ceiling,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Must be called inside a tokio runtime.
    pub fn play(&self) -> RingtoneHandle {
        let mut current = self.current.lock();
        if let Some(previous) = current.take() {
            previous.stop();
        }

        let voice = match self.output.open() {
            Ok(voice) => voice,
            Err(e) => {
                tracing::warn!(error = %e, "Could not open audio output for ringtone");
                return RingtoneHandle::stopped();
            }
        };

        let session = Arc::new(ToneSession {
            voice: Mutex::new(Some(voice)),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(run_pattern(session.clone(), self.pattern.clone(), self.ceiling));

        let handle = RingtoneHandle { session };
        *current = Some(handle.clone());
        handle
    }

    pub fn stop(&self) {
        if let Some(handle) = self.current.lock().take() {
            handle.stop();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map_or(false, RingtoneHandle::is_playing)
    }
}

async fn run_pattern(session: Arc<ToneSession>, pattern: TonePattern, ceiling: Duration) {
    let deadline = Instant::now() + ceiling;

    tokio::select! {
        _ = session.cancel.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
            tracing::debug!("Ringtone reached its ceiling, stopping");
        }
        _ = ring(&session, &pattern) => {}
    }

    session.stop();
}

/// Returns once the voice has been taken away.
async fn ring(session: &ToneSession, pattern: &TonePattern) {
    let cycle = pattern.cycle.max(Duration::from_millis(50));

    loop {
        let started = Instant::now();
        for _ in 0..pattern.beeps {
            {
                let mut voice = session.voice.lock();
                match voice.as_mut() {
                    Some(voice) => voice.tone(pattern.frequency_hz, pattern.beep),
                    None => return,
                }
            }
            tokio::time::sleep(pattern.beep + pattern.gap).await;
        }
        tokio::time::sleep_until(started + cycle).await;
    }
}

#[cfg(feature = "audio")]
mod rodio_output {
    use super::{AudioOutput, ToneVoice};
    use crate::error::{Error, Result};
    use rodio::{source::SineWave, OutputStream, Sink, Source};
    use std::sync::mpsc;
    use std::time::Duration;

    enum ToneCommand {
        Tone(f32, Duration),
        Silence,
    }

    /// Plays through the default output device.
    ///
    /// rodio streams are not `Send`, so each voice owns a small audio thread.
    pub struct RodioOutput {
        volume: f32,
    }

    impl RodioOutput {
        pub fn new(volume: f32) -> Self {
            Self { volume }
        }
    }

    impl Default for RodioOutput {
        fn default() -> Self {
            Self::new(0.25)
        }
    }

    impl AudioOutput for RodioOutput {
        fn open(&self) -> Result<Box<dyn ToneVoice>> {
            let (tx, rx) = mpsc::channel::<ToneCommand>();
            let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
            let volume = self.volume;

            std::thread::Builder::new()
                .name("ringtone-audio".into())
                .spawn(move || {
                    let (_stream, handle) = match OutputStream::try_default() {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                            return;
                        }
                    };
                    let sink = match Sink::try_new(&handle) {
                        Ok(sink) => sink,
                        Err(e) => {
                            let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    // Exits when the voice is dropped.
                    while let Ok(cmd) = rx.recv() {
                        match cmd {
                            ToneCommand::Tone(freq, duration) => sink.append(
                                SineWave::new(freq).take_duration(duration).amplify(volume),
                            ),
                            ToneCommand::Silence => sink.stop(),
                        }
                    }
                    sink.stop();
                })?;

            ready_rx
                .recv()
                .map_err(|_| Error::Audio("audio thread exited during startup".into()))??;

            Ok(Box::new(RodioVoice { tx }))
        }
    }

    struct RodioVoice {
        tx: mpsc::Sender<ToneCommand>,
    }

    impl ToneVoice for RodioVoice {
        fn tone(&mut self, frequency_hz: f32, duration: Duration) {
            let _ = self.tx.send(ToneCommand::Tone(frequency_hz, duration));
        }

        fn silence(&mut self) {
            let _ = self.tx.send(ToneCommand::Silence);
        }
    }
}
