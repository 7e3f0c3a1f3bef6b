//! Wire framing properties.
//!
//! Round-trip correctness across the size range, and the terminal error
//! cases: oversize lengths, zero lengths, and truncated streams.

use tokio::io::AsyncWriteExt;

use warren::buffer::BufferPool;
use warren::error::{Error, FramingError};
use warren::protocol::{read_frame, write_frame};
use warren::MTU;

#[tokio::test]
async fn round_trips_across_size_range() {
    let pool = BufferPool::new(4, 16, MTU);

    for size in [1usize, 20, 60, 512, MTU] {
        let (mut a, mut b) = tokio::io::duplex(2 * (MTU + 4));

        let mut out = pool.get();
        for (i, byte) in out.payload_mut()[..size].iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        out.set_len(size);
        let sent: Vec<u8> = out.payload().to_vec();

        write_frame(&mut a, &out).await.unwrap();
        drop(out);

        let got = read_frame(&mut b, &pool).await.unwrap();
        assert_eq!(got.len(), size, "size {size}");
        assert_eq!(got.payload(), &sent[..], "size {size}");
    }
}

#[tokio::test]
async fn back_to_back_frames_stay_in_sync() {
    let pool = BufferPool::new(4, 16, MTU);
    let (mut a, mut b) = tokio::io::duplex(8 * 1024);

    for size in [3usize, 700, 44] {
        let mut out = pool.get();
        out.payload_mut()[..size].fill(size as u8);
        out.set_len(size);
        write_frame(&mut a, &out).await.unwrap();
    }

    for size in [3usize, 700, 44] {
        let got = read_frame(&mut b, &pool).await.unwrap();
        assert_eq!(got.len(), size);
        assert!(got.payload().iter().all(|&b| b == size as u8));
    }
}

#[tokio::test]
async fn length_above_mtu_loses_framing() {
    let pool = BufferPool::new(2, 8, MTU);
    let (mut a, mut b) = tokio::io::duplex(256);

    a.write_all(&((MTU as u32) + 1).to_be_bytes()).await.unwrap();

    let err = read_frame(&mut b, &pool).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Framing(FramingError::FramingLost { .. })
    ));
}

#[tokio::test]
async fn eof_mid_header_is_short_read() {
    let pool = BufferPool::new(2, 8, MTU);
    let (mut a, mut b) = tokio::io::duplex(256);

    a.write_all(&[0, 0]).await.unwrap();
    drop(a);

    let err = read_frame(&mut b, &pool).await.unwrap_err();
    assert!(matches!(err, Error::Framing(FramingError::ShortRead)));
}

#[tokio::test]
async fn every_failure_path_returns_the_buffer() {
    let pool = BufferPool::new(3, 8, MTU);
    assert_eq!(pool.available(), 3);

    // Oversize length
    {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let _ = read_frame(&mut b, &pool).await.unwrap_err();
    }
    assert_eq!(pool.available(), 3);

    // Truncated payload
    {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&[0, 0, 0, 9, 1, 2]).await.unwrap();
        drop(a);
        let _ = read_frame(&mut b, &pool).await.unwrap_err();
    }
    assert_eq!(pool.available(), 3);

    // Success path returns on drop
    {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut out = pool.get();
        out.payload_mut()[..4].copy_from_slice(b"ping");
        out.set_len(4);
        write_frame(&mut a, &out).await.unwrap();
        drop(out);

        let got = read_frame(&mut b, &pool).await.unwrap();
        assert_eq!(got.payload(), b"ping");
    }
    assert_eq!(pool.available(), 3);
}
