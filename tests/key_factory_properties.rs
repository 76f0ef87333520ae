//! Key factory properties observable from outside the crate

use std::collections::HashSet;
use tor_comm::KeyFactory;

const SECRET: &[u8] = b"c2hhcmVkIHNlY3JldCBmcm9tIGVjZGg";

#[test]
fn test_independent_factories_stay_in_lockstep() {
    let sender = KeyFactory::new();
    let receiver = KeyFactory::new();
    sender.reseed(SECRET, 1234).unwrap();
    receiver.reseed(SECRET, 1234).unwrap();

    for track in [0usize, 17, 200, 254] {
        for _ in 0..40 {
            let a = sender.get_key_from_track(track, 256).unwrap();
            let b = receiver.get_key_from_track(track, 256).unwrap();
            assert_eq!(&a[..], &b[..]);
        }
    }
}

#[test]
fn test_offset_changes_every_track() {
    let a = KeyFactory::new();
    let b = KeyFactory::new();
    a.reseed(SECRET, 10).unwrap();
    b.reseed(SECRET, 11).unwrap();

    for track in 0..8 {
        assert_ne!(
            &a.get_key_from_track(track, 256).unwrap()[..],
            &b.get_key_from_track(track, 256).unwrap()[..]
        );
    }
}

#[test]
fn test_no_repeats_across_rollover() {
    let factory = KeyFactory::new();
    factory.reseed(SECRET, 42).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..1100 {
        let key = factory.get_key_from_track(3, 512).unwrap();
        assert!(seen.insert(key.to_vec()), "key repeated");
    }
}

#[test]
fn test_key_lengths() {
    let factory = KeyFactory::new();
    factory.reseed(SECRET, 0).unwrap();
    assert_eq!(factory.get_key_from_track(0, 128).unwrap().len(), 16);
    assert_eq!(factory.get_key_from_track(0, 256).unwrap().len(), 32);
    assert_eq!(factory.get_key_from_track(0, 512).unwrap().len(), 64);
    assert!(factory.get_key_from_track(0, 520).is_err());
}
