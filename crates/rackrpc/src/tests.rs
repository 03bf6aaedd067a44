use crate::catalog::*;
use crate::codec::{MAX_VALUE_LEN, record_from_bytes, record_to_bytes};
use crate::frame::decode_seq;
use crate::*;

use url::Url;
use wirepack::Encoder;

fn synthetic_images(n: usize) -> Vec<BootImage> {
    (0..n)
        .map(|i| BootImage {
            osystem: "ubuntu".into(),
            architecture: "amd64".into(),
            subarchitecture: "generic".into(),
            release: format!("release-{i}"),
            label: "release".into(),
            purpose: "xinstall".into(),
            xinstall_type: "squashfs".into(),
            xinstall_path: format!("/var/lib/maas/boot-resources/current/ubuntu/{i}/root.sqfs"),
        })
        .collect()
}

fn spec_of<C: Command>() -> &'static CommandSpec {
    C::SPEC
}

// ============================================================================
//  FIELD TYPES
// ============================================================================

#[test]
fn test_scalar_fields_roundtrip() -> anyhow::Result<()> {
    let spec = spec_of::<AddVMware>();
    let args = Record::new()
        .with("user", "admin")
        .with("host", "")
        .with("username", "root")
        .with("password", "hunter2")
        .with("port", 0i64)
        .with("accept_all", false);

    let bytes = record_to_bytes(spec.arguments, &args)?;
    let decoded = record_from_bytes(&bytes, spec.arguments)?;

    assert_eq!(decoded, args);
    assert_eq!(decoded.unicode("host")?, "");
    assert_eq!(decoded.opt_integer("port")?, Some(0));
    assert_eq!(decoded.opt_unicode("protocol")?, None);
    assert!(!decoded.contains("prefix_filter"));
    Ok(())
}

#[test]
fn test_bytes_and_json_roundtrip() -> anyhow::Result<()> {
    let spec = spec_of::<PowerQuery>();
    let context = serde_json::json!({"power_address": "qemu+ssh://10.0.0.1/system", "id": [1, 2]});
    let args = Record::new()
        .with("system_id", "abc123")
        .with("hostname", "node-1")
        .with("power_type", "virsh")
        .with("context", context.clone());

    let decoded = record_from_bytes(&record_to_bytes(spec.arguments, &args)?, spec.arguments)?;
    assert_eq!(decoded.json("context")?, &context);

    let auth = spec_of::<Authenticate>();
    let args = Record::new().with("message", vec![0u8, 255, 7]);
    let decoded = record_from_bytes(&record_to_bytes(auth.arguments, &args)?, auth.arguments)?;
    assert_eq!(decoded.bytes("message")?, &[0u8, 255, 7]);
    Ok(())
}

#[test]
fn test_url_fields() -> anyhow::Result<()> {
    let spec = spec_of::<ImportBootImages>();
    let proxy = Url::parse("http://proxy.example.com:3128/")?;
    let args = Record::new()
        .with("sources", Vec::<Record>::new())
        .with("http_proxy", proxy.clone());

    let decoded = record_from_bytes(&record_to_bytes(spec.arguments, &args)?, spec.arguments)?;
    assert_eq!(decoded.opt_url("http_proxy")?, Some(&proxy));
    assert_eq!(decoded.opt_url("https_proxy")?, None);
    Ok(())
}

#[test]
fn test_empty_optional_url_is_not_supplied() -> anyhow::Result<()> {
    let spec = spec_of::<ImportBootImages>();
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.variant_begin("sources")?;
    enc.list_begin()?;
    enc.list_end()?;
    enc.variant_end()?;
    enc.variant_begin("https_proxy")?;
    enc.str("")?;
    enc.variant_end()?;
    enc.map_end()?;

    let decoded = record_from_bytes(&enc.into_bytes()?, spec.arguments)?;
    assert!(!decoded.contains("https_proxy"));
    Ok(())
}

#[test]
fn test_nested_lists_roundtrip() -> anyhow::Result<()> {
    let spec = spec_of::<ListOperatingSystems>();
    let release = Record::new()
        .with("name", "noble")
        .with("title", "Ubuntu 24.04 LTS")
        .with("requires_license_key", false)
        .with("can_commission", true);
    let osystem = Record::new()
        .with("name", "ubuntu")
        .with("title", "Ubuntu")
        .with("releases", vec![release])
        .with("default_release", "noble");
    let response = Record::new().with("osystems", vec![osystem]);

    let decoded = record_from_bytes(&record_to_bytes(spec.response, &response)?, spec.response)?;
    assert_eq!(decoded, response);

    let os = &decoded.list("osystems")?[0];
    assert_eq!(os.opt_unicode("default_commissioning_release")?, None);
    assert!(os.list("releases")?[0].boolean("can_commission")?);
    Ok(())
}

#[test]
fn test_list_of_scalars() -> anyhow::Result<()> {
    let spec = spec_of::<PowerDriverCheck>();
    let response = Record::new().with("missing_packages", vec!["ipmitool".to_owned(), "wsmancli".to_owned()]);

    let decoded = record_from_bytes(&record_to_bytes(spec.response, &response)?, spec.response)?;
    assert_eq!(decoded.strings("missing_packages")?, vec!["ipmitool", "wsmancli"]);
    Ok(())
}

// ============================================================================
//  COMPRESSED LISTS
// ============================================================================

#[test]
fn test_compressed_list_matches_plain_list() -> anyhow::Result<()> {
    for n in [0, 1, 37] {
        let response = BootImage::to_response(&synthetic_images(n));

        let plain = spec_of::<ListBootImages>().response;
        let compressed = spec_of::<ListBootImagesV2>().response;

        let via_plain = record_from_bytes(&record_to_bytes(plain, &response)?, plain)?;
        let via_compressed = record_from_bytes(&record_to_bytes(compressed, &response)?, compressed)?;

        assert_eq!(via_plain, via_compressed);
        assert_eq!(BootImage::from_response(&via_compressed)?, synthetic_images(n));
    }
    Ok(())
}

#[test]
fn test_value_cap_applies_only_to_plain_lists() -> anyhow::Result<()> {
    let response = BootImage::to_response(&synthetic_images(500));

    let plain = spec_of::<ListBootImages>().response;
    match record_to_bytes(plain, &response) {
        Err(Error::ValueTooLong { field, len }) => {
            assert_eq!(field, "images");
            assert!(len > MAX_VALUE_LEN);
        }
        other => panic!("expected ValueTooLong, got {:?}", other),
    }

    let compressed = spec_of::<ListBootImagesV2>().response;
    let decoded = record_from_bytes(&record_to_bytes(compressed, &response)?, compressed)?;
    assert_eq!(decoded.list("images")?.len(), 500);
    Ok(())
}

#[test]
fn test_optional_compressed_hosts() -> anyhow::Result<()> {
    let spec = spec_of::<ConfigureDHCPv4>();
    let subnet = |hosts: Option<Vec<Record>>| {
        let mut r = Record::new();
        for key in [
            "subnet", "subnet_mask", "subnet_cidr", "broadcast_ip", "interface", "router_ip",
            "dns_servers", "ntp_server", "domain_name", "ip_range_low", "ip_range_high",
        ] {
            r.insert(key, "x");
        }
        if let Some(hosts) = hosts {
            r.insert("hosts", hosts);
        }
        r
    };
    let host = Record::new().with("host", "node1").with("mac", "00:11:22:33:44:55").with("ip", "10.0.0.5");
    let args = Record::new()
        .with("omapi_key", "key")
        .with("subnet_configs", vec![subnet(Some(vec![host])), subnet(None)]);

    let decoded = record_from_bytes(&record_to_bytes(spec.arguments, &args)?, spec.arguments)?;
    assert_eq!(decoded, args);
    Ok(())
}

// ============================================================================
//  VALIDATION
// ============================================================================

#[test]
fn test_missing_required_field() {
    let spec = spec_of::<GetOSReleaseTitle>();
    let args = Record::new().with("osystem", "ubuntu");
    assert_eq!(
        record_to_bytes(spec.arguments, &args),
        Err(Error::MissingField("release".into()))
    );
}

#[test]
fn test_unknown_field_refused_on_encode_skipped_on_decode() -> anyhow::Result<()> {
    let spec = spec_of::<GetOSReleaseTitle>();
    let args = Record::new()
        .with("osystem", "ubuntu")
        .with("release", "noble")
        .with("colour", "blue");
    assert_eq!(
        record_to_bytes(spec.arguments, &args),
        Err(Error::UnknownField("colour".into()))
    );

    // A newer peer may send fields we do not know yet.
    let wider = [
        Field::required("osystem", FieldType::Unicode),
        Field::required("release", FieldType::Unicode),
        Field::required("colour", FieldType::Unicode),
    ];
    let decoded = record_from_bytes(&record_to_bytes(&wider, &args)?, spec.arguments)?;
    assert!(!decoded.contains("colour"));
    Ok(())
}

#[test]
fn test_type_mismatch_and_bad_json() -> anyhow::Result<()> {
    let spec = spec_of::<GetOSReleaseTitle>();
    let args = Record::new().with("osystem", true).with("release", "noble");
    assert!(matches!(
        record_to_bytes(spec.arguments, &args),
        Err(Error::TypeMismatch { .. })
    ));

    let spec = spec_of::<DescribePowerTypes>();
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.variant_begin("power_types")?;
    enc.str("{not json")?;
    enc.variant_end()?;
    enc.map_end()?;
    assert!(matches!(
        record_from_bytes(&enc.into_bytes()?, spec.response),
        Err(Error::Json { .. })
    ));
    Ok(())
}

// ============================================================================
//  CATALOG & ERRORS
// ============================================================================

#[test]
fn test_catalog_names_are_unique_and_resolvable() {
    for (i, spec) in ALL.iter().enumerate() {
        assert!(ALL[i + 1..].iter().all(|other| other.name != spec.name), "{}", spec.name);
        assert_eq!(lookup(spec.name), Some(*spec));
    }
    assert_eq!(ALL.len(), 27);
    assert!(lookup("FormatHardDrive").is_none());
}

#[test]
fn test_error_classification() {
    let spec = spec_of::<PowerOn>();
    assert_eq!(spec.classify_error("PowerActionFail"), Ok(ErrorKind::PowerActionFail));
    // Declared elsewhere but not by this command.
    assert_eq!(
        spec.classify_error("NoSuchOperatingSystem"),
        Err(ProtocolFailure::Unhandled)
    );
    assert_eq!(spec.classify_error("UNAUTHENTICATED"), Err(ProtocolFailure::Unauthenticated));
    assert_eq!(spec.classify_error("gibberish"), Err(ProtocolFailure::Unhandled));

    for kind in spec.errors {
        assert_eq!(ErrorKind::from_tag(kind.tag()), Some(*kind));
    }
}

// ============================================================================
//  FRAMES
// ============================================================================

#[test]
fn test_call_frame_roundtrip() -> anyhow::Result<()> {
    let spec = spec_of::<GetOSReleaseTitle>();
    let args = Record::new().with("osystem", "ubuntu").with("release", "noble");

    let mut enc = Encoder::new();
    CallEncoder::new(42, spec, &args).encode(&mut enc)?;
    let bytes = enc.into_bytes()?;

    assert_eq!(decode_seq(&bytes)?, 42);
    match Frame::decode(&bytes)? {
        Frame::Call(mut call) => {
            assert_eq!(call.seq, 42);
            assert_eq!(call.command, "GetOSReleaseTitle");
            let decoded = codec::decode_record(&mut call.args, spec.arguments)?;
            assert_eq!(decoded, args);
        }
        _ => panic!("expected a call frame"),
    }
    Ok(())
}

#[test]
fn test_answer_and_error_frames() -> anyhow::Result<()> {
    let spec = spec_of::<Identify>();
    let fields = Record::new().with("ident", "region:pid=17");

    let mut enc = Encoder::new();
    AnswerEncoder::new(7, spec, &fields).encode(&mut enc)?;
    let bytes = enc.into_bytes()?;
    match Frame::decode(&bytes)? {
        Frame::Answer(mut answer) => {
            assert_eq!(answer.seq, 7);
            assert_eq!(codec::decode_record(&mut answer.fields, spec.response)?, fields);
        }
        _ => panic!("expected an answer frame"),
    }

    let mut enc = Encoder::new();
    ErrorEncoder::new(8, "PowerActionFail", "ipmi timed out").encode(&mut enc)?;
    let bytes = enc.into_bytes()?;
    match Frame::decode(&bytes)? {
        Frame::Error(err) => {
            assert_eq!((err.seq, err.code, err.description), (8, "PowerActionFail", "ipmi timed out"));
        }
        _ => panic!("expected an error frame"),
    }
    Ok(())
}

#[test]
fn test_frame_missing_seq() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("Error")?;
    enc.map_begin()?;
    enc.variant_begin("code")?;
    enc.str("UNHANDLED")?;
    enc.variant_end()?;
    enc.map_end()?;
    enc.variant_end()?;
    let bytes = enc.into_bytes()?;

    assert!(matches!(Frame::decode(&bytes), Err(Error::ProtocolViolation(_))));
    assert!(decode_seq(&bytes).is_err());
    Ok(())
}

// ============================================================================
//  HANDSHAKE MATH
// ============================================================================

#[test]
fn test_authenticate_digest() {
    let secret = b"shared secret";
    let message = auth::challenge();
    assert_eq!(message.len(), auth::NONCE_LEN);

    let proof = auth::respond(secret, &message);
    assert_eq!(proof.salt.len(), auth::NONCE_LEN);
    assert_eq!(proof.digest, auth::digest(secret, &message, &proof.salt));
    assert!(auth::verify(secret, &message, &proof));
    assert!(!auth::verify(b"wrong secret", &message, &proof));

    // A fresh salt every time.
    assert_ne!(auth::respond(secret, &message), proof);
}
