//! Configuration as it appears in JSON settings files

#![cfg(feature = "serde")]

use pretty_assertions::assert_eq;
use stratum_memory::{MallocLimit, MemFlags, MemoryConfig, TrackingLevel};

#[test]
fn partial_document_fills_defaults() {
    let config: MemoryConfig = serde_json::from_str(
        r#"{ "tracking": "detail", "malloc_limit": "compiler:500m,1g", "use_large_pages": true }"#,
    )
    .unwrap();

    assert_eq!(config.tracking, TrackingLevel::Detail);
    assert!(config.use_large_pages);
    assert_eq!(config.malloc_limit.total(), Some(1 << 30));
    assert_eq!(config.malloc_limit.category(MemFlags::Compiler), Some(500 << 20));
    assert_eq!(config.large_page_size, None);
}

#[test]
fn round_trip() {
    let config = MemoryConfig {
        tracking: TrackingLevel::Summary,
        malloc_limit: MallocLimit::none().with_category(MemFlags::Internal, 64 << 20),
        catch_ptr: Some(0xdead_b000),
        ..MemoryConfig::production()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains(r#""malloc_limit":"internal:64m""#), "{json}");
    let back: MemoryConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn bad_limit_is_rejected() {
    let err = serde_json::from_str::<MemoryConfig>(r#"{ "malloc_limit": "bogus:1m" }"#).unwrap_err();
    assert!(err.to_string().contains("bogus"), "{err}");
}
