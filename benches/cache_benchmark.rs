//! Performance benchmarks for booking-sync
//!
//! This benchmark suite measures:
//! - BookingCache merge and single-event application across set sizes
//! - Store-backed listing through BookingService
//! - End-to-end conversion against the in-memory gateway
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use booking_sync::entity::{Record, Row};
use booking_sync::gateway::{ChangeEvent, ChangeKind, InMemoryStore, StoreGateway};
use booking_sync::notify::NoOpNotifier;
use booking_sync::{
    BookingCache, BookingConfig, BookingRequest, BookingService, BookingStatus,
    ConversionRequest, FetchStrategy, Session, ViewFilter,
};
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;

// ============================================================================
// Benchmark Fixtures
// ============================================================================

fn booking(i: usize, minutes_updated: Option<i64>) -> BookingRequest {
    let created = Utc
        .with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
        .unwrap()
        + Duration::minutes(i as i64);
    BookingRequest {
        id: format!("b{}", i),
        tenant_id: "salon-1".to_string(),
        customer_name: format!("Customer {}", i),
        customer_email: Some(format!("c{}@example.com", i)),
        customer_phone: None,
        requested_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        requested_time: "10:00".to_string(),
        service_id: Some("s1".to_string()),
        service_name: Some("Taglio".to_string()),
        service_duration: Some(30),
        service_price: Some(40.0),
        staff_id: Some("t1".to_string()),
        notes: String::new(),
        status: if i % 3 == 0 {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Pending
        },
        archived: false,
        created_at: created,
        updated_at: minutes_updated.map(|m| created + Duration::minutes(m)),
    }
}

fn batch(size: usize, updated: Option<i64>) -> Vec<BookingRequest> {
    (0..size).map(|i| booking(i, updated)).collect()
}

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("Failed to build row")
}

// ============================================================================
// Cache Benchmarks
// ============================================================================

fn cache_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("booking_cache");

    for size in [10, 100, 1_000].iter() {
        // Cold load into an empty cache
        group
            .throughput(Throughput::Elements(*size as u64))
            .bench_with_input(BenchmarkId::new("merge_cold", size), size, |b, &size| {
                let incoming = batch(size, None);
                b.iter(|| {
                    let mut cache = BookingCache::new(ViewFilter::active());
                    black_box(cache.replace_or_merge(black_box(incoming.clone())))
                });
            });

        // Refetch where every row is newer than the cached copy
        group
            .throughput(Throughput::Elements(*size as u64))
            .bench_with_input(BenchmarkId::new("merge_newer", size), size, |b, &size| {
                let mut warm = BookingCache::new(ViewFilter::active());
                warm.replace_or_merge(batch(size, None));
                let incoming = batch(size, Some(5));
                b.iter(|| {
                    let mut cache = warm.clone();
                    black_box(cache.replace_or_merge(black_box(incoming.clone())))
                });
            });

        // Single realtime update in a populated cache
        group.bench_with_input(BenchmarkId::new("apply_event", size), size, |b, &size| {
            let mut warm = BookingCache::new(ViewFilter::active());
            warm.replace_or_merge(batch(size, None));
            let event = ChangeEvent {
                table: BookingRequest::TABLE.to_string(),
                kind: ChangeKind::Update,
                row: booking(size / 2, Some(10)).to_row().expect("Failed to encode"),
            };
            b.iter(|| {
                let mut cache = warm.clone();
                black_box(cache.apply(black_box(&event)).expect("Failed to apply"))
            });
        });
    }

    group.finish();
}

// ============================================================================
// Service Benchmarks
// ============================================================================

fn service_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("booking_service");
    let rt = tokio::runtime::Runtime::new().expect("Failed to create runtime");

    for size in [100, 1_000].iter() {
        group
            .throughput(Throughput::Elements(*size as u64))
            .bench_with_input(BenchmarkId::new("list_merge", size), size, |b, &size| {
                let store = InMemoryStore::new();
                let rows = batch(size, None)
                    .iter()
                    .map(|b| b.to_row().expect("Failed to encode"))
                    .collect();
                store.seed(BookingRequest::TABLE, rows);
                let service = BookingService::new(
                    store,
                    NoOpNotifier,
                    Session::new("salon-1", "user-1"),
                    BookingConfig::default(),
                );

                b.to_async(&rt).iter(|| async {
                    service
                        .list_bookings(black_box(FetchStrategy::Merge))
                        .await
                        .expect("Failed to list")
                });
            });
    }

    // Full conversion: lookups plus four writes
    group.bench_function("convert", |b| {
        b.to_async(&rt).iter(|| async {
            let store = InMemoryStore::new();
            store.seed(
                "services",
                vec![row(json!({"id": "s1", "salon_id": "salon-1", "name": "Taglio", "duration": 30, "price": 40}))],
            );
            store
                .insert(
                    BookingRequest::TABLE,
                    booking(1, None).to_row().expect("Failed to encode"),
                )
                .await
                .expect("Failed to insert");
            let service = BookingService::new(
                store,
                NoOpNotifier,
                Session::new("salon-1", "user-1"),
                BookingConfig::default(),
            );
            service
                .convert_to_appointment(black_box(ConversionRequest::new("b1", "t1", "s1")))
                .await
                .expect("Failed to convert")
        });
    });

    group.finish();
}

criterion_group!(benches, cache_benchmarks, service_benchmarks);
criterion_main!(benches);
