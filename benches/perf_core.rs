use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grove_analyst::cache::{AnalysisCache, AnalysisRecord, CacheKey, FileStore};
use grove_analyst::cost::{Money, PriceTable, TokenUsage};
use grove_analyst::gateway::prompt::PromptPlan;
use grove_analyst::item::{Item, ItemId};
use grove_analyst::models::{Mode, SONNET_MODEL_ID};
use grove_analyst::profile::Profile;
use serde_json::json;
use uuid::Uuid;

fn synthetic_profile(extra_fields: usize) -> Profile {
    let mut profile = Profile::from_value(json!({
        "fit_preferences": ["relaxed", "regular"],
        "color_palette": ["navy", "olive", "cream"],
        "budget_range": "40-120",
        "body_type": "athletic",
        "style_keywords": ["minimal", "workwear", "outdoor"]
    }))
    .expect("object profile");
    for i in 0..extra_fields {
        profile.insert(format!("custom_{:03}", i), json!({"weight": i, "tags": ["a", "b"]}));
    }
    profile
}

fn bench_profile_version(c: &mut Criterion) {
    let small = synthetic_profile(0);
    let large = synthetic_profile(200);
    c.bench_function("profile_version_small", |b| {
        b.iter(|| black_box(small.version()));
    });
    c.bench_function("profile_version_large", |b| {
        b.iter(|| black_box(large.version()));
    });
}

fn bench_cost(c: &mut Criterion) {
    let prices = PriceTable::default();
    let usage = TokenUsage {
        input: 1_250,
        output: 830,
        cache_read: 6_400,
        cache_write: 0,
    };
    c.bench_function("cost_sonnet", |b| {
        b.iter(|| black_box(prices.cost(black_box(&usage), SONNET_MODEL_ID)));
    });
}

fn bench_prompt_plan(c: &mut Criterion) {
    let item = Item {
        title: Some("Relaxed Chino".to_string()),
        description: Some("Garment-dyed cotton twill with a tapered leg".to_string()),
        ..Item::new("https://shop.example.com/p/chino")
    };
    let profile = synthetic_profile(20);
    c.bench_function("prompt_plan_full_capped", |b| {
        b.iter(|| black_box(PromptPlan::full(&item, &profile).capped(4)));
    });
}

fn bench_store_lookup(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileStore::open(temp.path()).expect("open store");

    runtime.block_on(async {
        for i in 0..2_000 {
            let item_id = ItemId::from_url(&format!("https://shop.example.com/p/{:05}", i)).expect("url");
            let record = AnalysisRecord {
                id: Uuid::new_v4(),
                item_id,
                profile_version: None,
                mode: Mode::Basic,
                model: SONNET_MODEL_ID.to_string(),
                tokens: TokenUsage::ZERO,
                cost: Money::from_micros(1_000),
                result: json!({"score": i}),
                created_at: Utc::now(),
            };
            store.store(record).await.expect("store record");
        }
    });

    let hit = CacheKey::new(
        ItemId::from_url("https://shop.example.com/p/01000").expect("url"),
        None,
        Mode::Basic,
    );
    c.bench_function("file_store_lookup_hit", |b| {
        b.iter(|| black_box(runtime.block_on(store.lookup(&hit)).expect("lookup")));
    });

    c.bench_function("file_store_open_2000", |b| {
        b.iter(|| black_box(FileStore::open(temp.path()).expect("reopen")));
    });
}

criterion_group!(
    perf_core,
    bench_profile_version,
    bench_cost,
    bench_prompt_plan,
    bench_store_lookup
);
criterion_main!(perf_core);
