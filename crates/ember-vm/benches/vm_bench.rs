//! Whole-pipeline throughput benchmarks: compile + run realistic scripts.

use criterion::{criterion_group, criterion_main, Criterion};
use ember_vm::Vm;

const FIB: &str = "
    fun fib(n) {
        if (n < 2) return n;
        return fib(n - 1) + fib(n - 2);
    }
    fib(18);
";

const PARTICLES: &str = "
    class Particle {
        init(x, y) {
            this.x = x;
            this.y = y;
        }
        step(dt) {
            this.x = this.x + dt;
            this.y = this.y + dt * 2;
        }
    }

    var particles = nil;
    for (var i = 0; i < 64; i = i + 1) {
        var p = Particle(i, i);
        for (var t = 0; t < 32; t = t + 1) {
            p.step(0.16);
        }
        particles = p;
    }
";

const CLOSURES: &str = "
    fun counter() {
        var n = 0;
        fun bump() { n = n + 1; return n; }
        return bump;
    }

    var total = 0;
    for (var i = 0; i < 128; i = i + 1) {
        var bump = counter();
        bump();
        bump();
        total = total + bump();
    }
";

fn interpret(source: &str) {
    let mut vm = Vm::new();
    vm.interpret(source).expect("benchmark script runs clean");
}

fn vm_benchmarks(c: &mut Criterion) {
    c.bench_function("fib_recursion", |b| b.iter(|| interpret(FIB)));
    c.bench_function("particle_methods", |b| b.iter(|| interpret(PARTICLES)));
    c.bench_function("closure_churn", |b| b.iter(|| interpret(CLOSURES)));
}

criterion_group!(benches, vm_benchmarks);
criterion_main!(benches);
