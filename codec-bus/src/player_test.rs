use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::*;
use crate::error::ErrorKind;
use crate::testing::{
    ImmediatePacing, MockBackend, audio_track, collect_until, eventually, next_event, video_track,
};

const WAIT: Duration = Duration::from_secs(10);

fn engine(backend: &MockBackend, config: PlayerConfig) -> PlaybackEngine {
    let mut engine = PlaybackEngine::new(config, Arc::new(backend.clone()), Handle::current());
    engine.set_pacing(Arc::new(ImmediatePacing));
    engine
}

/// Holds the feeder once decoding reaches `percent`, until released.
fn hold_at(engine: &mut PlaybackEngine, percent: f32) -> Arc<AtomicBool> {
    let holding = Arc::new(AtomicBool::new(true));
    let flag = holding.clone();
    engine.set_net_throttle(Arc::new(move |progress: f32| {
        flag.load(Ordering::SeqCst) && progress >= percent
    }));
    holding
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prepare_play_to_end() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(20, 40, 25, 10), audio_track(20, 40)]);
    let engine = engine(&backend, PlayerConfig::new("clip.mp4", MediaKind::Video));
    let mut rx = engine.subscribe();

    assert!(!engine.start_play());
    engine.prepare()?;
    assert_eq!(next_event(&mut rx, WAIT).await, Some(PlayerEvent::Ready));
    assert_eq!(engine.state(), PlaybackState::NoPlay);
    assert_eq!(engine.duration_ms(), 800);

    assert!(engine.start_play());
    assert!(!engine.start_play());

    let events = collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    assert!(matches!(
        events.first(),
        Some(PlayerEvent::Format(info)) if info.duration_ms == 800 && info.width == 320
    ));
    let n = events.len();
    assert_eq!(events[n - 1], PlayerEvent::End);
    assert_eq!(events[n - 2], PlayerEvent::Progress(100.0));

    let expected: Vec<i64> = (0..20).map(|i| i * 40_000).collect();
    assert_eq!(backend.decoder_log.rendered(MediaKind::Video), expected);
    assert!(eventually(WAIT, || engine.state() == PlaybackState::NoPlay).await);
    assert_eq!(backend.decoder_log.released(), 1);
    assert_eq!(backend.demux_log.released(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_restore_only_toggle_play() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(500, 40, 25, 10)]);
    // real pacing keeps the source playing for seconds
    let engine = PlaybackEngine::new(
        PlayerConfig::new("long.mp4", MediaKind::Video),
        Arc::new(backend.clone()),
        Handle::current(),
    );
    let mut rx = engine.subscribe();

    assert!(!engine.pause());
    assert!(!engine.restore());
    engine.prepare()?;
    assert!(!engine.pause());
    assert!(engine.start_play());

    assert!(!engine.restore());
    assert!(engine.pause());
    assert_eq!(engine.state(), PlaybackState::Pause);
    assert!(!engine.pause());
    assert!(engine.restore());
    assert_eq!(engine.state(), PlaybackState::Play);

    assert!(engine.pause_or_restore());
    assert_eq!(engine.state(), PlaybackState::Pause);
    assert!(engine.pause_or_restore());
    assert_eq!(engine.state(), PlaybackState::Play);

    engine.stop();
    let events = collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    assert_eq!(events.last(), Some(&PlayerEvent::End));
    assert_eq!(backend.decoder_log.released(), 1);
    Ok(())
}

/// Frames are always early, so the drainer sits in its pacing wait.
struct AlwaysEarly;

impl PacingPolicy for AlwaysEarly {
    fn decide(&self, _skew_ms: i64, _frame_interval_ms: i64) -> PaceDecision {
        PaceDecision::Wait(Duration::from_secs(5))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_during_pacing_wait_does_not_render() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(50, 40, 25, 10)]);
    let mut engine = PlaybackEngine::new(
        PlayerConfig::new("slow.mp4", MediaKind::Video),
        Arc::new(backend.clone()),
        Handle::current(),
    );
    engine.set_pacing(Arc::new(AlwaysEarly));
    let mut rx = engine.subscribe();
    let log = backend.decoder_log.clone();

    engine.prepare()?;
    assert!(engine.start_play());
    let events = collect_until(&mut rx, WAIT, |e| matches!(e, PlayerEvent::Format(_))).await;
    assert!(matches!(events.last(), Some(PlayerEvent::Format(_))));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(engine.pause());
    assert!(eventually(WAIT, || log.dropped(MediaKind::Video) == vec![0]).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(log.rendered(MediaKind::Video).is_empty());
    assert_eq!(engine.state(), PlaybackState::Pause);

    engine.stop();
    collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_while_paused_stays_paused() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(500, 40, 25, 10)]);
    let engine = PlaybackEngine::new(
        PlayerConfig::new("long.mp4", MediaKind::Video),
        Arc::new(backend.clone()),
        Handle::current(),
    );
    let mut rx = engine.subscribe();
    let log = backend.decoder_log.clone();

    engine.prepare()?;
    assert!(engine.start_play());
    assert!(eventually(WAIT, || !log.rendered(MediaKind::Video).is_empty()).await);
    assert!(engine.pause());

    let seek = engine.seek_ms(10_000).expect("seek accepted");
    assert_eq!(seek.saved, PlaybackState::Pause);
    assert_eq!(seek.direction, SeekDirection::After);
    assert!(
        eventually(WAIT, || log.rendered(MediaKind::Video).last() == Some(&10_000_000)).await
    );
    assert!(eventually(WAIT, || engine.state() == PlaybackState::Pause).await);

    // the target frame is shown, playback stays held
    let shown = log.rendered(MediaKind::Video).len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.rendered(MediaKind::Video).len(), shown);

    assert!(engine.restore());
    assert!(eventually(WAIT, || log.rendered(MediaKind::Video).len() > shown).await);
    engine.stop();
    collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_track_is_resource_error() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![audio_track(10, 40)]);
    let engine = engine(&backend, PlayerConfig::new("voice.m4a", MediaKind::Video));
    let mut rx = engine.subscribe();

    let err = engine.prepare().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(matches!(
        next_event(&mut rx, WAIT).await,
        Some(PlayerEvent::Error(_))
    ));
    assert_eq!(backend.demux_log.released(), 1);
    assert!(!engine.start_play());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_forward_renders_from_target() -> anyhow::Result<()> {
    // 10 s at 25 fps, sync sample every 10 frames
    let backend = MockBackend::new(vec![video_track(250, 40, 25, 10)]);
    let mut engine = engine(&backend, PlayerConfig::new("net.mp4", MediaKind::Video));
    let holding = hold_at(&mut engine, 20.0);
    let mut rx = engine.subscribe();
    let log = backend.decoder_log.clone();

    engine.prepare()?;
    assert!(engine.start_play());
    assert!(eventually(WAIT, || engine.state() == PlaybackState::DataWait).await);
    assert!(
        eventually(WAIT, || log.rendered(MediaKind::Video).last() == Some(&2_000_000)).await
    );
    let before = log.rendered(MediaKind::Video).len();

    let seek = engine.seek_progress(0.5).expect("seek accepted");
    assert_eq!(seek.direction, SeekDirection::After);
    assert_eq!(seek.target_ms(), 5_000);
    assert_eq!(seek.saved, PlaybackState::DataWait);

    assert!(eventually(WAIT, || log.rendered(MediaKind::Video).len() > before).await);
    let after = log.rendered(MediaKind::Video)[before..].to_vec();
    assert_eq!(after[0], 5_000_000);
    assert!(after.windows(2).all(|w| w[0] <= w[1]));
    assert!(log.dropped(MediaKind::Video).contains(&4_800_000));
    assert_eq!(backend.demux_log.seeks(), vec![5_000_000]);

    holding.store(false, Ordering::SeqCst);
    collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    assert_eq!(log.rendered(MediaKind::Video).last(), Some(&9_960_000));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_seek_backward_lands_on_target() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(250, 40, 25, 10)]);
    let mut engine = engine(&backend, PlayerConfig::new("net.mp4", MediaKind::Video));
    let holding = hold_at(&mut engine, 60.0);
    let mut rx = engine.subscribe();
    let log = backend.decoder_log.clone();

    engine.prepare()?;
    assert!(engine.start_play());
    assert!(
        eventually(WAIT, || log.rendered(MediaKind::Video).last() == Some(&6_000_000)).await
    );
    let before = log.rendered(MediaKind::Video).len();

    let seek = engine.seek_ms(3_000).expect("seek accepted");
    assert_eq!(seek.direction, SeekDirection::Before);

    assert!(eventually(WAIT, || log.rendered(MediaKind::Video).len() > before).await);
    let after = log.rendered(MediaKind::Video)[before..].to_vec();
    // resumes from the sync sample at 2.8 s, rendering starts at the target
    assert_eq!(after[0], 3_000_000);
    assert!(log.dropped(MediaKind::Video).contains(&2_800_000));

    holding.store(false, Ordering::SeqCst);
    collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_looping_wraps_to_zero() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(5, 40, 25, 1)]);
    let engine = engine(
        &backend,
        PlayerConfig::new("loop.mp4", MediaKind::Video).with_looping(true),
    );
    let mut rx = engine.subscribe();
    let log = backend.decoder_log.clone();

    engine.prepare()?;
    assert!(engine.start_play());
    assert!(eventually(WAIT, || log.rendered(MediaKind::Video).len() >= 12).await);
    engine.stop();
    let events = collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    assert_eq!(events.last(), Some(&PlayerEvent::End));
    let formats = events
        .iter()
        .filter(|e| matches!(e, PlayerEvent::Format(_)))
        .count();
    assert_eq!(formats, 1);

    let rendered = log.rendered(MediaKind::Video);
    assert_eq!(
        &rendered[..7],
        &[0, 40_000, 80_000, 120_000, 160_000, 0, 40_000]
    );
    let seeks = backend.demux_log.seeks();
    assert!(seeks.len() >= 2);
    assert!(seeks.iter().all(|t| *t == 0));
    assert_eq!(backend.demux_log.released(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_audio_data_delivered() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(10, 40, 25, 10), audio_track(10, 23)]);
    let engine = engine(
        &backend,
        PlayerConfig::new("song.mp4", MediaKind::Audio)
            .with_audio_data(true)
            .with_auto_play(true),
    );
    let mut rx = engine.subscribe();

    engine.prepare()?;
    let events = collect_until(&mut rx, WAIT, |e| *e == PlayerEvent::End).await;
    assert!(!events.contains(&PlayerEvent::Ready));

    let audio: Vec<Bytes> = events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::AudioData(data) => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(audio.len(), 10);
    assert_eq!(audio[3].as_ref(), &3u32.to_le_bytes());
    assert_eq!(events.last(), Some(&PlayerEvent::End));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decode_failure_reports_error_without_end() -> anyhow::Result<()> {
    let backend =
        MockBackend::new(vec![video_track(50, 40, 25, 10)]).with_decode_failure_after(3);
    let engine = engine(&backend, PlayerConfig::new("bad.mp4", MediaKind::Video));
    let mut rx = engine.subscribe();

    engine.prepare()?;
    assert!(engine.start_play());
    let events = collect_until(&mut rx, WAIT, |e| matches!(e, PlayerEvent::Error(_))).await;
    assert!(matches!(events.last(), Some(PlayerEvent::Error(_))));

    assert!(eventually(WAIT, || engine.state() == PlaybackState::NoPlay).await);
    assert!(eventually(WAIT, || backend.decoder_log.released() == 1).await);
    assert_eq!(backend.demux_log.released(), 1);
    assert_ne!(
        next_event(&mut rx, Duration::from_millis(200)).await,
        Some(PlayerEvent::End)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_and_seek_before_start() -> anyhow::Result<()> {
    let backend = MockBackend::new(vec![video_track(50, 40, 25, 10)]);
    let engine = engine(&backend, PlayerConfig::new("idle.mp4", MediaKind::Video));

    engine.prepare()?;
    let seek = engine.seek_ms(1_000).expect("source repositioned");
    assert_eq!(seek.saved, PlaybackState::NoPlay);
    assert_eq!(backend.demux_log.seeks(), vec![1_000_000]);
    assert_eq!(engine.state(), PlaybackState::NoPlay);

    engine.stop();
    assert_eq!(backend.demux_log.released(), 1);
    assert_eq!(backend.decoder_log.released(), 1);
    assert!(!engine.start_play());
    assert!(engine.seek_ms(0).is_none());
    Ok(())
}
