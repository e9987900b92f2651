mod common;

use common::*;
use facegate::matcher::{
    REASON_INDEX_EMPTY, REASON_NO_FACE, REASON_RECOGNIZED, REASON_TIMED_OUT,
};
use facegate::service::Enrollment;
use facegate::{Error, NoFace, Outcome, RecognitionService};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn open(config: facegate::Config) -> RecognitionService {
    let embedder = embedder(&config);
    RecognitionService::open(config, embedder).unwrap()
}

#[test]
fn an_empty_index_denies_with_a_reason() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    assert!(service.is_empty());
    let decision = service.recognize(face_photo(1));
    assert_eq!(decision.outcome, Outcome::Denied);
    assert_eq!(decision.reason, REASON_INDEX_EMPTY);
}

#[test]
fn an_enrolled_face_is_recognised() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    let enrollment = service.enroll(7, face_photo(4)).unwrap();
    assert!(matches!(enrollment, Enrollment::Enrolled { slot: 0, .. }));
    assert_eq!(enrollment.vector().unwrap().dimension(), DIM);

    let decision = service.recognize(face_photo(4));
    assert!(decision.recognized);
    assert_eq!(decision.outcome, Outcome::Granted);
    assert_eq!(decision.employee_id, Some(7));
    assert_eq!(decision.reason, REASON_RECOGNIZED);
    assert!(decision.score.unwrap() > 0.999);
}

#[test]
fn a_faceless_photo_is_not_enrolled() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    let enrollment = service.enroll(7, faceless_photo()).unwrap();
    assert_eq!(enrollment, Enrollment::NoFace(NoFace::NotDetected));
    assert!(enrollment.vector().is_none());
    assert!(service.is_empty());
    assert!(!service.store().vectors_path().exists());

    service.enroll(7, face_photo(1)).unwrap();
    let decision = service.recognize(faceless_photo());
    assert_eq!(decision.outcome, Outcome::Denied);
    assert_eq!(decision.reason, REASON_NO_FACE);
    assert_eq!(service.len(), 1);
}

#[test]
fn enrollments_survive_a_restart() {
    let dir = tempdir().unwrap();
    {
        let service = open(config(dir.path()));
        service.enroll(7, face_photo(1)).unwrap();
        service.enroll(7, face_photo(2)).unwrap();
        service.enroll(9, face_photo(3)).unwrap();
    }
    let service = open(config(dir.path()));
    assert_eq!(service.len(), 3);
    assert_eq!(service.employee_count(), 2);
    assert_eq!(service.snapshot().owners(), &[7, 7, 9]);
    assert_eq!(service.recognize(face_photo(3)).employee_id, Some(9));
}

#[test]
fn a_batch_enrolls_every_usable_photo_and_persists() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    let report = service
        .enroll_batch(
            4,
            &[
                face_photo(1),
                faceless_photo(),
                face_photo(2),
                bytes::Bytes::from_static(b"garbage"),
            ],
        )
        .unwrap();
    assert_eq!(report.employee_id, 4);
    assert_eq!(report.enrolled, vec![0, 1]);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.skipped[0], (1, NoFace::NotDetected));
    assert_eq!(report.skipped[1].0, 3);
    assert!(report.skipped[1].1.is_failure());

    assert_eq!(service.store().load(DIM).owners(), &[4, 4]);
}

#[test]
fn a_batch_over_the_upload_limit_is_refused() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.max_photos_per_upload = 2;
    let service = open(config);
    let photos = vec![face_photo(1), face_photo(2), face_photo(3)];
    assert!(matches!(
        service.enroll_batch(1, &photos),
        Err(Error::TooManyPhotos { limit: 2, given: 3 })
    ));
    assert!(service.is_empty());
}

#[test]
fn rebuild_replaces_the_index_and_persists_it() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    service.enroll(1, face_photo(1)).unwrap();
    service.enroll(2, face_photo(2)).unwrap();

    let source = MemorySource::default()
        .employee(1, false)
        .employee(2, true)
        .employee(3, true)
        .photo(1, "a.png", face_photo(1))
        .photo(2, "b.png", face_photo(2))
        .photo(3, "c.png", face_photo(3))
        .photo(3, "d.png", faceless_photo());
    let report = service.rebuild(&source).unwrap();
    assert_eq!(report.employees, 2);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.skipped.len(), 1);

    assert_eq!(service.snapshot().owners(), &[2, 3]);
    assert_eq!(service.store().load(DIM).owners(), &[2, 3]);
    assert_ne!(service.recognize(face_photo(1)).employee_id, Some(1));
}

#[test]
fn a_failed_listing_keeps_the_current_index() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    service.enroll(1, face_photo(1)).unwrap();
    let mut source = MemorySource::default();
    source.fail_employees = true;
    assert!(matches!(service.rebuild(&source), Err(Error::Source(_))));
    assert_eq!(service.snapshot().owners(), &[1]);
}

#[test]
fn slow_embeddings_are_denied() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.embed_timeout_ms = 50;
    let slow = Arc::new(SlowEmbedder {
        inner: pipeline(&config),
        delay: Duration::from_millis(500),
        calls: AtomicUsize::new(0),
    });
    let service = RecognitionService::open(config, slow.clone()).unwrap();

    let decision = service.recognize(face_photo(1));
    assert_eq!(decision.outcome, Outcome::Denied);
    assert_eq!(decision.reason, REASON_TIMED_OUT);
    assert_eq!(
        service.enroll(1, face_photo(1)).unwrap(),
        Enrollment::NoFace(NoFace::TimedOut)
    );
    assert!(service.is_empty());

    // Abandoned embeddings still run to completion in the background.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn a_crashing_embedder_is_a_denial() {
    let dir = tempdir().unwrap();
    let service =
        RecognitionService::open(config(dir.path()), Arc::new(PanickingEmbedder)).unwrap();
    let decision = service.recognize(face_photo(1));
    assert_eq!(decision.outcome, Outcome::Denied);
    assert!(!decision.recognized);
    assert!(matches!(
        service.enroll(1, face_photo(1)).unwrap(),
        Enrollment::NoFace(NoFace::EmbeddingFailure(_))
    ));
}

#[test]
fn searches_run_alongside_enrollment() {
    let dir = tempdir().unwrap();
    let service = open(config(dir.path()));
    service.enroll(1, face_photo(1)).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            for seed in 2..8 {
                service.enroll(seed as i64, face_photo(seed)).unwrap();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..6 {
                    let decision = service.recognize(face_photo(1));
                    assert!(decision.is_granted());
                }
            });
        }
    });
    assert_eq!(service.len(), 7);
    assert_eq!(service.store().load(DIM).len(), 7);
}

#[test]
fn a_failed_persist_keeps_the_vector_in_memory() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, b"a file, not a directory").unwrap();
    let mut config = config(dir.path());
    config.index_path = blocker.join("face_index.vectors");
    config.mapping_path = blocker.join("face_index.meta");
    let service = open(config);

    assert!(matches!(
        service.enroll(5, face_photo(1)),
        Err(Error::Persist { attempts: 3, .. })
    ));
    assert_eq!(service.len(), 1);
    assert_eq!(service.recognize(face_photo(1)).employee_id, Some(5));
}

#[test]
fn the_embedder_must_match_the_configured_dimension() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    let embedder = embedder(&config);
    config.dimension = DIM + 1;
    assert!(matches!(
        RecognitionService::open(config, embedder),
        Err(Error::DimensionMismatch { .. })
    ));
}

#[test]
fn an_unreadable_index_starts_empty() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    fs::write(&config.index_path, b"FGVX").unwrap();
    fs::write(&config.mapping_path, b"????").unwrap();
    let service = open(config);
    assert!(service.is_empty());
    assert_eq!(service.recognize(face_photo(1)).reason, REASON_INDEX_EMPTY);
}

#[test]
fn a_crashing_photo_does_not_abort_a_rebuild() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let trigger = bytes::Bytes::from_static(b"boom");
    let embedder = Arc::new(CrashingOn {
        inner: pipeline(&config),
        trigger: trigger.clone(),
    });
    let service = RecognitionService::open(config, embedder).unwrap();
    let source = MemorySource::default()
        .employee(1, true)
        .photo(1, "a.png", face_photo(1))
        .photo(1, "bad.png", trigger);

    let report = service.rebuild(&source).unwrap();
    assert_eq!(report.embedded, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(service.len(), 1);
    assert_eq!(service.recognize(face_photo(1)).employee_id, Some(1));
}

#[test]
fn searches_use_the_previous_index_until_a_rebuild_completes() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let held = face_photo(3);
    let embedder = Arc::new(GatedEmbedder::new(pipeline(&config), held.clone()));
    let service = RecognitionService::open(config, embedder.clone()).unwrap();
    service.enroll(1, face_photo(1)).unwrap();

    let source = MemorySource::default()
        .employee(1, false)
        .employee(2, true)
        .photo(2, "a.png", face_photo(2))
        .photo(2, "b.png", held);

    thread::scope(|scope| {
        let rebuild = scope.spawn(|| service.rebuild(&source));
        embedder.wait_for_held();

        assert_eq!(service.len(), 1);
        assert_eq!(service.snapshot().owners(), &[1]);
        let decision = service.recognize(face_photo(1));
        assert!(decision.is_granted());
        assert_eq!(decision.employee_id, Some(1));
        assert!(!rebuild.is_finished());

        embedder.release();
        let report = rebuild.join().unwrap().unwrap();
        assert_eq!(report.embedded, 2);
    });
    assert_eq!(service.snapshot().owners(), &[2, 2]);
    assert_ne!(service.recognize(face_photo(1)).employee_id, Some(1));
}

#[test]
fn hung_embeddings_turn_further_requests_away() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.embed_timeout_ms = 20;
    config.max_pending_embeddings = 2;
    let slow = Arc::new(SlowEmbedder {
        inner: pipeline(&config),
        delay: Duration::from_millis(400),
        calls: AtomicUsize::new(0),
    });
    let service = RecognitionService::open(config, slow.clone()).unwrap();

    assert_eq!(service.embed(face_photo(1)), Err(NoFace::TimedOut));
    assert_eq!(service.embed(face_photo(1)), Err(NoFace::TimedOut));
    assert!(matches!(
        service.embed(face_photo(1)),
        Err(NoFace::EmbeddingFailure(_))
    ));
    let decision = service.recognize(face_photo(1));
    assert_eq!(decision.outcome, Outcome::Denied);
    assert_eq!(decision.reason, REASON_NO_FACE);

    // Once the abandoned embeddings finish, requests are accepted again.
    thread::sleep(Duration::from_millis(800));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    assert_eq!(service.embed(face_photo(1)), Err(NoFace::TimedOut));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 3);
}
