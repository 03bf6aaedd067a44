use crate::*;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalar_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.bool(true)?;
    enc.bool(false)?;
    enc.u64(u64::MAX)?;
    enc.s64(i64::MIN)?;
    enc.unit()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.bool()?);
    assert!(!dec.bool()?);
    assert_eq!(dec.u64()?, u64::MAX);
    assert_eq!(dec.s64()?, i64::MIN);
    dec.unit()?;
    dec.finish()
}

#[test]
fn test_blobs_are_zero_copy() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("hello")?;
    enc.str("")?;
    enc.bytes(&[0xde, 0xad, 0xbe, 0xef])?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    let s = dec.str()?;
    assert_eq!(s, "hello");
    assert!(std::ptr::eq(s.as_ptr(), bytes[5..].as_ptr()));
    assert_eq!(dec.str()?, "");
    assert_eq!(dec.bytes()?, &[0xde, 0xad, 0xbe, 0xef]);
    dec.finish()
}

#[test]
fn test_wrong_tag_is_reported() -> Result<()> {
    let mut enc = Encoder::new();
    enc.u64(7)?;
    let bytes = enc.into_bytes()?;

    let mut dec = Decoder::new(&bytes);
    assert_eq!(
        dec.s64(),
        Err(Error::UnexpectedTag { expected: Tag::S64, found: Tag::U64 })
    );
    // Failed reads do not consume.
    assert_eq!(dec.u64()?, 7);
    Ok(())
}

// ============================================================================
//  CONTAINERS
// ============================================================================

#[test]
fn test_nested_list() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.u64(1)?;
    enc.list_begin()?;
    enc.str("inner")?;
    enc.list_end()?;
    enc.u64(3)?;
    enc.list_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut items = dec.list()?;

    assert_eq!(items.next()?.ok_or(Error::UnexpectedEnd)?.u64()?, 1);
    let mut inner = items.next()?.ok_or(Error::UnexpectedEnd)?.list()?;
    assert_eq!(inner.next()?.ok_or(Error::UnexpectedEnd)?.str()?, "inner");
    assert!(inner.next()?.is_none());
    assert_eq!(items.next()?.ok_or(Error::UnexpectedEnd)?.u64()?, 3);
    assert!(items.next()?.is_none());
    dec.finish()
}

#[test]
fn test_map_of_variants() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.variant_begin("osystem")?;
    enc.str("ubuntu")?;
    enc.variant_end()?;
    enc.variant_begin("count")?;
    enc.s64(-2)?;
    enc.variant_end()?;
    enc.map_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut entries = dec.map()?;

    let (key, mut val) = entries.next()?.ok_or(Error::UnexpectedEnd)?;
    assert_eq!(key, "osystem");
    assert_eq!(val.str()?, "ubuntu");

    let (key, mut val) = entries.next()?.ok_or(Error::UnexpectedEnd)?;
    assert_eq!(key, "count");
    assert_eq!(val.s64()?, -2);

    assert!(entries.next()?.is_none());
    Ok(())
}

#[test]
fn test_skip_nested_container() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.map_begin()?;
    enc.variant_begin("k")?;
    enc.bytes(&[1, 2, 3])?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.list_end()?;
    enc.bool(true)?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    dec.skip()?;
    assert!(dec.bool()?);
    dec.finish()
}

// ============================================================================
//  SCOPE VALIDATION
// ============================================================================

#[test]
fn test_map_rejects_bare_values() {
    let mut enc = Encoder::new();
    assert!(enc.map_begin().is_ok());
    assert_eq!(enc.u64(1), Err(Error::InvalidMapEntry));
}

#[test]
fn test_variant_holds_exactly_one_item() {
    let mut enc = Encoder::new();
    assert!(enc.variant_begin("v").is_ok());
    assert_eq!(enc.variant_end(), Err(Error::EmptyVariant));
    assert!(enc.unit().is_ok());
    assert_eq!(enc.unit(), Err(Error::TooManyItems));
    assert!(enc.variant_end().is_ok());
}

#[test]
fn test_scope_errors() {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end(), Err(Error::ScopeUnderflow));
    assert!(enc.list_begin().is_ok());
    assert_eq!(
        enc.map_end(),
        Err(Error::ScopeMismatch { expected: Scope::Map, actual: Scope::List })
    );
    assert_eq!(enc.into_bytes(), Err(Error::ScopeStillOpen));
}

// ============================================================================
//  HOSTILE INPUT
// ============================================================================

#[test]
fn test_truncated_input() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("truncate me")?;
    let bytes = enc.into_bytes()?;

    for cut in 0..bytes.len() {
        let mut dec = Decoder::new(&bytes[..cut]);
        assert_eq!(dec.str(), Err(Error::UnexpectedEnd), "cut at {}", cut);
    }
    Ok(())
}

#[test]
fn test_bogus_length_does_not_panic() {
    let bytes = [Tag::List as u8, 0xff, 0xff, 0xff, 0xff, 0x01];
    let mut dec = Decoder::new(&bytes);
    assert!(matches!(dec.list(), Err(Error::UnexpectedEnd)));
}

#[test]
fn test_invalid_tag_and_utf8() {
    let mut dec = Decoder::new(&[0x7f]);
    assert_eq!(dec.peek_tag(), Err(Error::InvalidTag(0x7f)));

    let bytes = [Tag::String as u8, 2, 0, 0, 0, 0xc3, 0x28];
    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.str(), Err(Error::InvalidUtf8));
}

#[test]
fn test_trailing_bytes() -> Result<()> {
    let mut enc = Encoder::new();
    enc.unit()?;
    enc.unit()?;
    let bytes = enc.into_bytes()?;

    let mut dec = Decoder::new(&bytes);
    dec.unit()?;
    assert_eq!(dec.finish(), Err(Error::TrailingBytes(1)));
    Ok(())
}
