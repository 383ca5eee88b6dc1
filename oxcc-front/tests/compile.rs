//! Whole-pipeline tests: source text in, patched flat image out.

use oxcc_codegen::binemit::Image;
use oxcc_codegen::{isa, Context};
use oxcc_front::{compile, FrontOptions};
use std::str::FromStr;
use target_lexicon::Triple;

const START: u64 = 0x10000;

fn try_build(src: &str) -> Result<Image, String> {
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    let isa = isa::lookup(triple).unwrap();
    let mut ctx = Context::new(isa, START);
    let diags = compile(src, &FrontOptions::default(), &mut ctx);
    if !diags.is_ok() {
        return Err(diags.to_string());
    }
    ctx.finish().map_err(|e| e.to_string())
}

fn build(src: &str) -> Image {
    match try_build(src) {
        Ok(image) => image,
        Err(e) => panic!("compilation failed:\n{}", e),
    }
}

fn symbol(image: &Image, name: &str) -> u64 {
    image
        .symbols
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("symbol `{}` missing", name))
        .address
}

fn data_at(image: &Image, name: &str, len: usize) -> Vec<u8> {
    let off = (symbol(image, name) - image.start_address) as usize;
    image.bytes[off..off + len].to_vec()
}

fn contains(bytes: &[u8], needle: &[u8]) -> bool {
    bytes.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn constant_expression_in_return() {
    let image = build("int main(void) { return 1 + 2 * 3; }");
    assert_eq!(symbol(&image, "main"), START);
    // The fold happens at parse time: the body loads the immediate 7.
    let mov_eax_7 = [0xb8, 7, 0, 0, 0];
    assert!(
        image.bytes.windows(5).any(|w| w == mov_eax_7),
        "expected `mov eax, 7` in the emitted code"
    );
}

#[test]
fn recursive_calls_resolve() {
    let image = build(
        "int f(int n) { return n <= 1 ? n : f(n - 1) + f(n - 2); }\n\
         int main(void) { return f(10); }",
    );
    assert_eq!(symbol(&image, "f"), START);
    assert!(symbol(&image, "main") > symbol(&image, "f"));
    // `n <= 1` branches over the base case with an inverted `jg`.
    assert!(contains(&image.bytes, &[0x0f, 0x8f]), "expected `jg` from the ternary test");
    // The recursive arguments are computed as `sub eax, 1` / `sub eax, 2`.
    assert!(contains(&image.bytes, &[0x83, 0xe8, 0x01]), "expected `sub eax, 1` for f(n-1)");
    assert!(contains(&image.bytes, &[0x83, 0xe8, 0x02]), "expected `sub eax, 2` for f(n-2)");
    // main stages the literal 10 and pushes it for the call.
    assert!(
        contains(&image.bytes, &[0xb8, 10, 0, 0, 0, 0x50]),
        "expected `mov eax, 10; push rax` staging f(10)"
    );
}

#[test]
fn loops_and_arrays() {
    let image = build(
        "int main(void) { int a[5] = {1, 2, 3, 4, 5}; int s = 0;\n\
         for (int i = 0; i < 5; ++i) s += a[i]; return s; }",
    );
    // Every initializer element is staged as a 32-bit immediate on its way
    // to the frame slot.
    for k in 1..=5u8 {
        assert!(contains(&image.bytes, &[0xb8, k, 0, 0, 0]), "missing `mov eax, {}`", k);
    }
    // `i < 5` guards the loop with an inverted `jge` to the exit.
    assert!(contains(&image.bytes, &[0x0f, 0x8d]), "expected `jge` from the loop condition");
    // `++i` is an `add eax, 1` through the scratch register.
    assert!(contains(&image.bytes, &[0x83, 0xc0, 0x01]), "expected `add eax, 1` for ++i");
}

#[test]
fn structs_by_member() {
    let image = build(
        "struct P { int x, y; };\n\
         int main(void) { struct P p = {3, 4}; return p.x * p.x + p.y * p.y; }",
    );
    // The member initializers land as immediates.
    assert!(contains(&image.bytes, &[0xb8, 3, 0, 0, 0]), "missing `mov eax, 3` for p.x");
    assert!(contains(&image.bytes, &[0xb8, 4, 0, 0, 0]), "missing `mov eax, 4` for p.y");
    // p.y sits at offset 4: its address is a `lea` with displacement 4
    // (the displacement follows a SIB byte when the base is rsp-class).
    assert!(
        image.bytes.windows(5).any(|w| {
            (w[0] & 0xf8) == 0x48
                && w[1] == 0x8d
                && (w[2] & 0xc0) == 0x40
                && (w[3] == 4 || (w[3] == 0x24 && w[4] == 4))
        }),
        "expected `lea reg, [base + 4]` addressing p.y"
    );
    // x*x and y*y each need an imul.
    let imuls = image.bytes.windows(2).filter(|w| w == &[0x0f, 0xaf]).count();
    assert!(imuls >= 2, "expected two `imul` instructions, saw {}", imuls);
}

#[test]
fn string_walk() {
    let image = build(
        "int main(void) { char *s = \"abc\"; int n = 0;\n\
         while (*s) { ++n; ++s; } return n; }",
    );
    // The literal (with its NUL) is interned into rodata.
    assert!(image.info.rodata_size >= 4);
    let bytes = &image.bytes;
    assert!(bytes.windows(4).any(|w| w == b"abc\0"));
}

#[test]
fn designated_initializers_in_data() {
    let image = build(
        "int a[5] = {[4] = 9, [1] = 2};\n\
         int main(void) { return a[0] + a[1] + a[2] + a[3] + a[4]; }",
    );
    let a = data_at(&image, "a", 20);
    let words: Vec<i32> =
        a.chunks(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
    assert_eq!(words, vec![0, 2, 0, 0, 9]);
}

#[test]
fn sizeof_string_includes_the_nul() {
    let image = build("int n = sizeof(\"abc\"); int main(void) { return n; }");
    assert_eq!(data_at(&image, "n", 4), vec![4, 0, 0, 0]);
}

#[test]
fn global_pointer_initializer_is_relocated() {
    let image = build("int x; int *p = &x; int main(void) { return *p; }");
    let x_addr = symbol(&image, "x");
    assert_eq!(data_at(&image, "p", 8), x_addr.to_le_bytes().to_vec());
}

#[test]
fn bss_lives_outside_the_file() {
    let image = build("char buf[4096]; int main(void) { return buf[0]; }");
    assert!(image.info.bss_size >= 4096);
    assert!(u64::from(image.info.file_size()) < u64::from(image.info.mem_size()));
}

#[test]
fn static_local_becomes_module_data() {
    let image = build(
        "int bump(void) { static int n = 5; return ++n; }\n\
         int main(void) { bump(); return bump(); }",
    );
    let label = image.symbols.iter().find(|s| s.name.starts_with("n."));
    let label = label.expect("static local symbol");
    assert!(!label.global);
    let off = (label.address - image.start_address) as usize;
    assert_eq!(&image.bytes[off..off + 4], &[5, 0, 0, 0]);
}

#[test]
fn switch_dispatch_compiles() {
    let image = build(
        "int classify(int c) { switch (c) { case 1: return 10; case 7: return 70;\n\
         default: return -1; } }\n\
         int main(void) { return classify(7); }",
    );
    // The selector is compared against each case value: `cmp reg, imm8`
    // encodes as 0x83 with /7 in the ModRM byte.
    let cmp_imm = |v: u8| {
        image.bytes.windows(3).any(|w| w[0] == 0x83 && w[1] >= 0xf8 && w[2] == v)
    };
    assert!(cmp_imm(1), "expected `cmp reg, 1` in the dispatch");
    assert!(cmp_imm(7), "expected `cmp reg, 7` in the dispatch");
    // One equality branch per case label.
    let jes = image.bytes.windows(2).filter(|w| w == &[0x0f, 0x84]).count();
    assert!(jes >= 2, "expected two `je` dispatch branches, saw {}", jes);
    // Each arm returns its folded constant, default included.
    assert!(contains(&image.bytes, &[0xb8, 10, 0, 0, 0]), "missing `mov eax, 10`");
    assert!(contains(&image.bytes, &[0xb8, 70, 0, 0, 0]), "missing `mov eax, 70`");
    assert!(
        contains(&image.bytes, &[0xb8, 0xff, 0xff, 0xff, 0xff]),
        "missing `mov eax, -1` for the default arm"
    );
}

#[test]
fn goto_forward_and_backward() {
    let image = build(
        "int main(void) { int n = 0; again: ++n; if (n < 3) goto again;\n\
         if (n == 3) goto done; n = 100; done: return n; }",
    );
    // ++n through the scratch register.
    assert!(contains(&image.bytes, &[0x83, 0xc0, 0x01]), "expected `add eax, 1` for ++n");
    // The backward goto patches to a negative rel32 displacement.
    assert!(
        image.bytes.windows(5).any(|w| w[0] == 0xe9 && w[4] == 0xff),
        "expected a backward `jmp` with a negative displacement"
    );
    // The skipped-over assignment still emits its immediate.
    assert!(contains(&image.bytes, &[0xb8, 100, 0, 0, 0]), "missing `mov eax, 100`");
    // `n == 3` branches with an inverted `jne`.
    assert!(contains(&image.bytes, &[0x0f, 0x85]), "expected `jne` from the == test");
}

#[test]
fn floating_point_paths() {
    let image = build(
        "double hyp2(double a, double b) { return a * a + b * b; }\n\
         int main(void) { return (int)hyp2(3.0, 4.0); }",
    );
    assert!(image.info.rodata_size >= 8, "float literals go to rodata");
}

#[test]
fn no_flonum_rejects_doubles() {
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    let isa = isa::lookup(triple).unwrap();
    let mut ctx = Context::new(isa, START);
    let options = FrontOptions { no_flonum: true, ..FrontOptions::default() };
    let diags = compile("double d = 1.0; int main(void) { return 0; }", &options, &mut ctx);
    assert!(!diags.is_ok());
}

#[test]
fn undeclared_identifier_fails_the_unit() {
    let err = try_build("int main(void) { return nope; }").unwrap_err();
    assert!(err.contains("not declared"));
}

#[test]
fn unresolved_goto_label_fails_the_unit() {
    let err = try_build("int main(void) { goto nowhere; return 0; }").unwrap_err();
    assert!(err.contains("nowhere"));
}

#[test]
fn many_arguments_spill_to_the_stack() {
    let image = build(
        "int sum8(int a, int b, int c, int d, int e, int f, int g, int h) {\n\
           return a + b + c + d + e + f + g + h; }\n\
         int main(void) { return sum8(1, 2, 3, 4, 5, 6, 7, 8); }",
    );
    // All eight arguments are staged as immediates.
    for k in 1..=8u8 {
        assert!(contains(&image.bytes, &[0xb8, k, 0, 0, 0]), "missing `mov eax, {}`", k);
    }
    // Two stack-passed arguments reserve 16 bytes: `sub rsp, 16`.
    assert!(contains(&image.bytes, &[0x48, 0x83, 0xec, 0x10]), "expected `sub rsp, 16`");
    // The callee reads g and h from their incoming slots at rbp+16/rbp+24.
    let rbp_load = |disp: u8| {
        image
            .bytes
            .windows(3)
            .any(|w| w[0] == 0x8b && (w[1] & 0xc7) == 0x45 && w[2] == disp)
    };
    assert!(rbp_load(0x10), "expected a load from [rbp + 16] for g");
    assert!(rbp_load(0x18), "expected a load from [rbp + 24] for h");
}

// --- parse-time folding against a reference evaluator --------------------

#[derive(Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Div,
    Mod,
    Shl,
    Shr,
}

enum Node {
    Lit(i32),
    Bin(Op, Box<Node>, Box<Node>),
}

struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn gen_node(rng: &mut Rng, depth: u32) -> Node {
    if depth == 0 || rng.below(3) == 0 {
        return Node::Lit((rng.below(201) as i32) - 100);
    }
    let op = match rng.below(10) {
        0 => Op::Add,
        1 => Op::Sub,
        2 => Op::Mul,
        3 => Op::And,
        4 => Op::Or,
        5 => Op::Xor,
        6 => Op::Div,
        7 => Op::Mod,
        8 => Op::Shl,
        _ => Op::Shr,
    };
    let lhs = Box::new(gen_node(rng, depth - 1));
    let rhs = match op {
        // Keep division and shift right operands safe and literal.
        Op::Div | Op::Mod => Box::new(Node::Lit((rng.below(50) as i32) + 1)),
        Op::Shl | Op::Shr => Box::new(Node::Lit(rng.below(31) as i32)),
        _ => Box::new(gen_node(rng, depth - 1)),
    };
    Node::Bin(op, lhs, rhs)
}

fn render(node: &Node, out: &mut String) {
    match node {
        Node::Lit(v) => {
            if *v < 0 {
                out.push_str(&format!("({})", v));
            } else {
                out.push_str(&v.to_string());
            }
        }
        Node::Bin(op, lhs, rhs) => {
            out.push('(');
            render(lhs, out);
            out.push_str(match op {
                Op::Add => " + ",
                Op::Sub => " - ",
                Op::Mul => " * ",
                Op::And => " & ",
                Op::Or => " | ",
                Op::Xor => " ^ ",
                Op::Div => " / ",
                Op::Mod => " % ",
                Op::Shl => " << ",
                Op::Shr => " >> ",
            });
            render(rhs, out);
            out.push(')');
        }
    }
}

fn eval(node: &Node) -> i32 {
    match node {
        Node::Lit(v) => *v,
        Node::Bin(op, lhs, rhs) => {
            let a = eval(lhs);
            let b = eval(rhs);
            match op {
                Op::Add => a.wrapping_add(b),
                Op::Sub => a.wrapping_sub(b),
                Op::Mul => a.wrapping_mul(b),
                Op::And => a & b,
                Op::Or => a | b,
                Op::Xor => a ^ b,
                Op::Div => a.wrapping_div(b),
                Op::Mod => a.wrapping_rem(b),
                Op::Shl => a.wrapping_shl(*match rhs.as_ref() {
                    Node::Lit(s) => s,
                    _ => unreachable!(),
                } as u32),
                Op::Shr => a.wrapping_shr(*match rhs.as_ref() {
                    Node::Lit(s) => s,
                    _ => unreachable!(),
                } as u32),
            }
        }
    }
}

#[test]
fn folded_constants_match_a_reference_evaluator() {
    let mut rng = Rng(0x9e3779b97f4a7c15);
    for round in 0..200 {
        let node = gen_node(&mut rng, 4);
        let mut src = String::from("int v = ");
        render(&node, &mut src);
        src.push_str("; int main(void) { return 0; }");
        let image = build(&src);
        let v = data_at(&image, "v", 4);
        let got = i32::from_le_bytes([v[0], v[1], v[2], v[3]]);
        let want = eval(&node);
        assert_eq!(got, want, "round {}: {}", round, src);
    }
}
