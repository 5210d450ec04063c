use polyserve::buffer::ByteAccumulator;

const CAP: usize = 16;

fn filled(len: usize) -> ByteAccumulator<CAP> {
    let mut buf = ByteAccumulator::new();
    for i in 0..len {
        buf.push((i % 256) as u8).unwrap();
    }
    buf.complete().unwrap();
    buf
}

fn expected(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

#[test]
fn test_buffer_boundaries() {
    for len in [0, 1, CAP - 1, CAP, CAP + 1, 10 * CAP] {
        let buf = filled(len);
        assert_eq!(buf.written(), len, "written for {}", len);
        assert_eq!(buf.get(), &expected(len)[..], "content for {}", len);
        assert_eq!(buf.is_heap(), len > CAP, "mode for {}", len);
    }
}

#[test]
fn test_buffer_copy_is_independent() {
    let mut buf = filled(CAP + 3);
    let copy = buf.copy().unwrap();
    buf.reset();

    assert_eq!(copy, expected(CAP + 3));
    assert!(buf.is_empty());
}

#[test]
fn test_buffer_reuse_after_heap_mode() {
    let mut buf = filled(10 * CAP);
    buf.reset();
    assert!(!buf.is_heap());

    buf.extend(b"GET").unwrap();
    buf.complete().unwrap();
    assert_eq!(buf.as_str(), Some("GET"));
}

#[test]
fn test_buffer_pop_back_across_modes() {
    let mut buf = filled(CAP + 1);
    assert_eq!(buf.back(), Some((CAP % 256) as u8));
    assert_eq!(buf.pop_back(), Some((CAP % 256) as u8));
    assert_eq!(buf.written(), CAP);

    let mut small: ByteAccumulator<CAP> = ByteAccumulator::new();
    assert_eq!(small.pop_back(), None);
    small.push(b'x').unwrap();
    assert_eq!(small.pop_back(), Some(b'x'));
    assert!(small.is_empty());
}

#[test]
fn test_buffer_invalid_utf8() {
    let mut buf: ByteAccumulator<CAP> = ByteAccumulator::new();
    buf.extend(&[0xff, 0xfe]).unwrap();
    buf.complete().unwrap();
    assert_eq!(buf.as_str(), None);
}
