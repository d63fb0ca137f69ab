use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use devsync::directory::Directory;
use devsync::sync::changes::{get_changes, get_necessary_file_changes, Hashes};
use devsync::sync::conflicts::get_conflicts;
use std::fs;
use tempfile::TempDir;

/// `count` files spread over ten directories, every `edit_every`th one changed
fn hash_maps(count: usize, edit_every: usize) -> (Hashes, Hashes) {
    let mut from = Hashes::new();
    let mut to = Hashes::new();
    for dir in 0..10 {
        from.insert(format!("dir_{}/", dir), "d".to_string());
        to.insert(format!("dir_{}/", dir), "d".to_string());
    }
    for i in 0..count {
        let key = format!("dir_{}/file_{}.txt", i % 10, i);
        from.insert(key.clone(), format!("h{}", i));
        if i % edit_every != 0 {
            to.insert(key, format!("h{}", i));
        } else if i % (edit_every * 2) == 0 {
            to.insert(key, format!("h{}-edited", i));
        }
        // the rest are deleted
    }
    (from, to)
}

fn bench_get_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_changes");

    for count in [1_000, 10_000, 100_000].iter() {
        let (from, to) = hash_maps(*count, 20);
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(get_changes(black_box(&from), black_box(&to))));
        });
    }
    group.finish();
}

fn bench_necessary_and_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("necessary_and_conflicts");

    for count in [1_000, 10_000].iter() {
        let (base, local) = hash_maps(*count, 10);
        let (_, environment) = hash_maps(*count, 7);
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let local_changes =
                    get_necessary_file_changes(&get_changes(&base, &local), &environment);
                let environment_changes =
                    get_necessary_file_changes(&get_changes(&base, &environment), &local);
                black_box(get_conflicts(&local_changes, &environment_changes))
            });
        });
    }
    group.finish();
}

fn bench_directory_hashes(c: &mut Criterion) {
    let mut group = c.benchmark_group("directory_hashes");
    group.sample_size(20);

    for count in [100, 1_000].iter() {
        let temp = TempDir::new().unwrap();
        for i in 0..*count {
            let dir = temp.path().join(format!("dir_{}", i % 10));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("file_{}.txt", i)), format!("content_{}", i)).unwrap();
        }
        let directory = Directory::open(temp.path()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(directory.hashes().unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_get_changes,
    bench_necessary_and_conflicts,
    bench_directory_hashes
);
criterion_main!(benches);
