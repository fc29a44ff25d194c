//! Option merging, fingerprinting and compile/load/fold benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use vcomp::*;

const KERNEL: &str = r#"
#ifndef N
#define N 16
#endif
int main(int argc, char **argv) {
    int acc = 0;
    for (int i = 0; i < N; i++) acc += i;
    return acc & 0x7f;
}
"#;

fn cc_available() -> bool {
    std::process::Command::new("cc")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn bench_merge_options(c: &mut Criterion) {
    let mut options = Vec::new();
    for i in 0..64 {
        options.push(make_keyed_option(format!("axis{}", i % 8), "-D", format!("VALUE_{}", i)));
        options.push(make_option(format!("-Wextra-{}", i)));
    }

    c.bench_function("merge_options_128", |b| {
        b.iter(|| merge_options(black_box(&options)))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("kernel.c");
    let mut content = String::from(KERNEL);
    for i in 0..2000 {
        content.push_str(&format!("int helper_{}(int x) {{ return x + {}; }}\n", i, i));
    }
    fs::write(&source, content).unwrap();

    let compiler = Arc::new(SystemCompiler::new("cc", "cc", temp_dir.path(), None));
    let mut builder = Builder::new();
    builder
        .compiler(compiler)
        .add_source_file(&source)
        .add_option(CompileOption::optimization(2))
        .entry_point("main");
    let version = builder.build().unwrap();

    c.bench_function("fingerprint_large_source", |b| {
        b.iter(|| version.request().fingerprint(black_box("cc")).unwrap())
    });
}

fn bench_compile_load_fold(c: &mut Criterion) {
    if !cc_available() {
        eprintln!("skipping compile benchmarks: no system C compiler");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let source = temp_dir.path().join("kernel.c");
    fs::write(&source, KERNEL).unwrap();

    type MainFn = unsafe extern "C" fn(i32, *mut *mut std::os::raw::c_char) -> i32;
    let run = |compiler: Arc<SystemCompiler>| {
        let mut builder = Builder::new();
        builder.compiler(compiler).add_source_file(&source).entry_point("main");
        let version = builder.build().unwrap();
        assert!(version.compile());
        let code = version.with_symbol(|sym| unsafe {
            let main: MainFn = sym.cast();
            main(0, std::ptr::null_mut())
        });
        version.fold();
        code
    };

    let mut group = c.benchmark_group("cycle");
    group.sample_size(10);

    let cached = Arc::new(SystemCompiler::new("cc", "cc", temp_dir.path().join("cached"), None));
    group.bench_function("reuse_load_fold", |b| b.iter(|| run(cached.clone())));

    let fresh = Arc::new(
        SystemCompiler::new("cc", "cc", temp_dir.path().join("fresh"), None).with_reuse_artifacts(false),
    );
    group.bench_function("compile_load_fold", |b| b.iter(|| run(fresh.clone())));

    group.finish();
}

criterion_group!(benches, bench_merge_options, bench_fingerprint, bench_compile_load_fold);
criterion_main!(benches);
