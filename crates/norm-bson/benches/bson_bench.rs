use criterion::{criterion_group, criterion_main, Criterion};
use norm_bson::{bson_entity, expando, BsonCodec, BsonEntity, Expando, ObjectId, TypeMapBuilder};

#[derive(Debug, Default, Clone)]
struct Profile {
    id: ObjectId,
    name: String,
    age: i64,
    active: bool,
    score: f64,
    tags: Vec<String>,
}

impl BsonEntity for Profile {
    fn describe(map: &mut TypeMapBuilder<Self>) {
        map.field("Id", |p| &p.id, |p, v| p.id = v);
        map.field("Name", |p| &p.name, |p, v| p.name = v);
        map.field("Age", |p| &p.age, |p, v| p.age = v);
        map.field("Active", |p| &p.active, |p, v| p.active = v);
        map.field("Score", |p| &p.score, |p, v| p.score = v);
        map.collection("Tags", |p| &p.tags, |p| &mut p.tags);
    }
}

bson_entity!(Profile);

fn sample_profile() -> Profile {
    Profile {
        id: ObjectId::new(),
        name: "Miku".to_string(),
        age: 16,
        active: true,
        score: 99.5,
        tags: vec!["vocal".to_string(), "teal".to_string()],
    }
}

fn bench_expando_encode(c: &mut Criterion) {
    let codec = BsonCodec::new();
    let doc = expando! {
        "name" => "Miku",
        "age" => 16i64,
        "active" => true,
        "score" => 99.5,
    };

    c.bench_function("expando_encode", |b| b.iter(|| codec.encode(&doc)));
}

fn bench_expando_decode(c: &mut Criterion) {
    let codec = BsonCodec::new();
    let doc = expando! {
        "name" => "Miku",
        "age" => 16i64,
        "active" => true,
        "score" => 99.5,
    };
    let encoded = codec.encode(&doc).unwrap();

    c.bench_function("expando_decode", |b| {
        b.iter(|| codec.decode::<Expando>(&encoded))
    });
}

fn bench_entity_encode(c: &mut Criterion) {
    let codec = BsonCodec::new();
    let profile = sample_profile();

    c.bench_function("entity_encode", |b| b.iter(|| codec.encode(&profile)));
}

fn bench_entity_decode(c: &mut Criterion) {
    let codec = BsonCodec::new();
    let encoded = codec.encode(&sample_profile()).unwrap();

    c.bench_function("entity_decode", |b| {
        b.iter(|| codec.decode::<Profile>(&encoded))
    });
}

fn bench_large_array(c: &mut Criterion) {
    let codec = BsonCodec::new();
    let numbers: Vec<i64> = (0..1000).collect();
    let doc = expando! { "numbers" => numbers };
    let encoded = codec.encode(&doc).unwrap();

    c.bench_function("large_array_encode", |b| b.iter(|| codec.encode(&doc)));
    c.bench_function("large_array_decode", |b| {
        b.iter(|| codec.decode::<Expando>(&encoded))
    });
}

criterion_group!(
    benches,
    bench_expando_encode,
    bench_expando_decode,
    bench_entity_encode,
    bench_entity_decode,
    bench_large_array,
);
criterion_main!(benches);
