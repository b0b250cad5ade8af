//! Sample programs and seeded random program generation.

use anyhow::Result;
use callflow_ir::{KernelOp, Program, ProgramBuilder, TensorId};
use ndarray::{ArrayD, IxDyn};

#[derive(Debug, Clone)]
pub struct SampleProgram {
    pub name: String,
    pub description: String,
    pub program: Program,
    pub inputs: Vec<ArrayD<f32>>,
    /// The scheduler must refuse this program.
    pub expect_rejection: bool,
}

impl SampleProgram {
    fn new(name: &str, description: &str, program: Program, seed: u64) -> Self {
        let inputs = deterministic_inputs(&program, seed);
        Self {
            name: name.to_string(),
            description: description.to_string(),
            program,
            inputs,
            expect_rejection: false,
        }
    }

    fn rejected(mut self) -> Self {
        self.expect_rejection = true;
        self
    }
}

/// Seeded values in `[-1, 1)` for every entry input.
pub fn deterministic_inputs(program: &Program, seed: u64) -> Vec<ArrayD<f32>> {
    let mut rng = fastrand::Rng::with_seed(seed);
    program
        .entry_inputs()
        .iter()
        .map(|&id| {
            let shape = &program.tensor(id).shape;
            ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.f32() * 2.0 - 1.0)
        })
        .collect()
}

pub fn samples() -> Result<Vec<SampleProgram>> {
    Ok(vec![
        SampleProgram::new(
            "split",
            "one non-tail call followed by an add",
            split_sample()?,
            1,
        ),
        SampleProgram::new(
            "two-callers",
            "one body called from two sites with different destinations",
            two_callers_sample()?,
            2,
        ),
        SampleProgram::new(
            "straight-line",
            "kernels only; scheduling must leave it untouched",
            straight_line_sample()?,
            3,
        ),
        SampleProgram::new(
            "nested",
            "a helper called non-tail from a body that is itself called twice",
            nested_sample()?,
            4,
        ),
        SampleProgram::new(
            "branches",
            "switch between two bodies whose result is used afterwards",
            branches_sample()?,
            5,
        ),
        SampleProgram::new(
            "select",
            "switch_layer over three bodies, one of them shared",
            select_sample()?,
            6,
        ),
        countdown_sample()?,
        SampleProgram::new(
            "self-recursion",
            "direct non-tail self call",
            self_recursion_sample()?,
            7,
        )
        .rejected(),
    ])
}

pub fn sample(name: &str) -> Result<Option<SampleProgram>> {
    Ok(samples()?.into_iter().find(|sample| sample.name == name))
}

fn split_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let x = b.tensor("x", &[4]);
    let fx = b.tensor("f_x", &[4]);
    let fy = b.tensor("f_y", &[4]);
    let h = b.tensor("h", &[]);
    let r = b.tensor("r", &[4]);
    let out = b.tensor("out", &[4]);
    let main = b.declare("main");
    let f = b.declare("f");
    b.subgraph(f)
        .inputs(&[fx])
        .kernel("square", KernelOp::Mul, &[fx, fx], &[fy])
        .returns(&[fy])
        .finish();
    b.subgraph(main)
        .inputs(&[x])
        .partial("bind_f", f, &[x], h)
        .call("call_f", h, &[r])
        .kernel("add", KernelOp::Add, &[r, x], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

fn two_callers_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let x = b.tensor("x", &[4]);
    let y = b.tensor("y", &[4]);
    let sx = b.tensor("s_x", &[4]);
    let sy = b.tensor("s_y", &[4]);
    let ss = b.tensor("s_sum", &[4]);
    let h1 = b.tensor("h1", &[]);
    let h2 = b.tensor("h2", &[]);
    let r1 = b.tensor("r1", &[4]);
    let r2 = b.tensor("r2", &[4]);
    let out = b.tensor("out", &[4]);
    let main = b.declare("main");
    let shared = b.declare("shared");
    b.subgraph(shared)
        .inputs(&[sx, sy])
        .kernel("sum", KernelOp::Add, &[sx, sy], &[ss])
        .returns(&[ss])
        .finish();
    b.subgraph(main)
        .inputs(&[x, y])
        .partial("bind_first", shared, &[x, y], h1)
        .call("first", h1, &[r1])
        .partial("bind_second", shared, &[r1, x], h2)
        .call("second", h2, &[r2])
        .kernel("diff", KernelOp::Sub, &[r2, y], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

fn straight_line_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let a = b.tensor("a", &[2, 2]);
    let c = b.constant("c", &[2, 2], vec![1.0, 0.5, -0.5, 2.0]);
    let t = b.tensor("t", &[2, 2]);
    let out = b.tensor("out", &[2, 2]);
    let main = b.declare("main");
    b.subgraph(main)
        .inputs(&[a])
        .kernel("scale", KernelOp::Mul, &[a, c], &[t])
        .kernel("negate", KernelOp::Neg, &[t], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

fn nested_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let x = b.tensor("x", &[3]);
    let gx = b.tensor("g_x", &[3]);
    let gy = b.tensor("g_y", &[3]);
    let fx = b.tensor("f_x", &[3]);
    let fh = b.tensor("f_h", &[]);
    let fr = b.tensor("f_r", &[3]);
    let fy = b.tensor("f_y", &[3]);
    let h1 = b.tensor("h1", &[]);
    let h2 = b.tensor("h2", &[]);
    let r1 = b.tensor("r1", &[3]);
    let r2 = b.tensor("r2", &[3]);
    let out = b.tensor("out", &[3]);
    let main = b.declare("main");
    let f = b.declare("f");
    let g = b.declare("g");
    b.subgraph(g)
        .inputs(&[gx])
        .kernel("negate", KernelOp::Neg, &[gx], &[gy])
        .returns(&[gy])
        .finish();
    b.subgraph(f)
        .inputs(&[fx])
        .partial("bind_g", g, &[fx], fh)
        .call("call_g", fh, &[fr])
        .kernel("twice", KernelOp::Add, &[fr, fr], &[fy])
        .returns(&[fy])
        .finish();
    b.subgraph(main)
        .inputs(&[x])
        .partial("bind_f1", f, &[x], h1)
        .call("call_f1", h1, &[r1])
        .partial("bind_f2", f, &[r1], h2)
        .call("call_f2", h2, &[r2])
        .kernel("mix", KernelOp::Mul, &[r2, x], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

fn branches_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let x = b.tensor("x", &[1]);
    let zero = b.constant("zero", &[1], vec![0.0]);
    let cond = b.tensor("cond", &[1]);
    let px = b.tensor("p_x", &[1]);
    let nx = b.tensor("n_x", &[1]);
    let ny = b.tensor("n_y", &[1]);
    let ha = b.tensor("h_pos", &[]);
    let hb = b.tensor("h_neg", &[]);
    let h = b.tensor("h", &[]);
    let r = b.tensor("r", &[1]);
    let out = b.tensor("out", &[1]);
    let main = b.declare("main");
    let positive = b.declare("positive");
    let negative = b.declare("negative");
    b.subgraph(positive).inputs(&[px]).returns(&[px]).finish();
    b.subgraph(negative)
        .inputs(&[nx])
        .kernel("flip", KernelOp::Neg, &[nx], &[ny])
        .returns(&[ny])
        .finish();
    b.subgraph(main)
        .inputs(&[x])
        .kernel("is_neg", KernelOp::Less, &[x, zero], &[cond])
        .partial("bind_pos", positive, &[x], ha)
        .partial("bind_neg", negative, &[x], hb)
        .switch("abs", cond, hb, ha, h)
        .call("call_abs", h, &[r])
        .kernel("double", KernelOp::Add, &[r, r], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

fn select_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let index = b.constant("index", &[1], vec![2.0]);
    let x = b.tensor("x", &[2]);
    let ax = b.tensor("a_x", &[2]);
    let ay = b.tensor("a_y", &[2]);
    let cx = b.tensor("c_x", &[2]);
    let h0 = b.tensor("h0", &[]);
    let h1 = b.tensor("h1", &[]);
    let h2 = b.tensor("h2", &[]);
    let h = b.tensor("h", &[]);
    let hc = b.tensor("hc", &[]);
    let r = b.tensor("r", &[2]);
    let r2 = b.tensor("r2", &[2]);
    let out = b.tensor("out", &[2]);
    let main = b.declare("main");
    let double = b.declare("double");
    let copy = b.declare("copy");
    b.subgraph(double)
        .inputs(&[ax])
        .kernel("double", KernelOp::Add, &[ax, ax], &[ay])
        .returns(&[ay])
        .finish();
    b.subgraph(copy).inputs(&[cx]).returns(&[cx]).finish();
    b.subgraph(main)
        .inputs(&[x])
        .partial("bind_0", copy, &[x], h0)
        .partial("bind_1", double, &[x], h1)
        .partial("bind_2", double, &[x], h2)
        .switch_layer("pick", index, &[h0, h1, h2], h)
        .call("call_pick", h, &[r])
        .partial("bind_again", double, &[r], hc)
        .call("call_again", hc, &[r2])
        .kernel("sub", KernelOp::Sub, &[r2, x], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

/// Sums `n, n-1, .., 1` with a tail-recursive loop driven by a switch.
fn countdown_sample() -> Result<SampleProgram> {
    let mut b = ProgramBuilder::new();
    let n = b.tensor("n", &[1]);
    let zero = b.constant("zero", &[1], vec![0.0]);
    let one = b.constant("one", &[1], vec![1.0]);
    let hm = b.tensor("h_main", &[]);
    let total = b.tensor("total", &[1]);
    let out = b.tensor("out", &[1]);
    let ln = b.tensor("l_n", &[1]);
    let lacc = b.tensor("l_acc", &[1]);
    let cond = b.tensor("more", &[1]);
    let n1 = b.tensor("n1", &[1]);
    let acc1 = b.tensor("acc1", &[1]);
    let again = b.tensor("h_again", &[]);
    let stop = b.tensor("h_stop", &[]);
    let h = b.tensor("h", &[]);
    let lr = b.tensor("l_r", &[1]);
    let da = b.tensor("d_acc", &[1]);
    let main = b.declare("main");
    let body = b.declare("loop");
    let done = b.declare("done");
    b.subgraph(done).inputs(&[da]).returns(&[da]).finish();
    b.subgraph(body)
        .inputs(&[ln, lacc])
        .kernel("more", KernelOp::Less, &[zero, ln], &[cond])
        .kernel("dec", KernelOp::Sub, &[ln, one], &[n1])
        .kernel("acc", KernelOp::Add, &[lacc, ln], &[acc1])
        .partial("again", body, &[n1, acc1], again)
        .partial("stop", done, &[lacc], stop)
        .switch("pick", cond, again, stop, h)
        .call("next", h, &[lr])
        .returns(&[lr])
        .finish();
    b.subgraph(main)
        .inputs(&[n])
        .partial("start", body, &[n, zero], hm)
        .call("run", hm, &[total])
        .kernel("negate", KernelOp::Neg, &[total], &[out])
        .returns(&[out])
        .finish();
    let program = b.build(main)?;
    let inputs = vec![ArrayD::from_elem(IxDyn(&[1]), 5.0)];
    Ok(SampleProgram {
        name: "countdown".to_string(),
        description: "tail-recursive loop called non-tail from the entry".to_string(),
        program,
        inputs,
        expect_rejection: false,
    })
}

fn self_recursion_sample() -> Result<Program> {
    let mut b = ProgramBuilder::new();
    let x = b.tensor("x", &[1]);
    let h = b.tensor("h", &[]);
    let r = b.tensor("r", &[1]);
    let out = b.tensor("out", &[1]);
    let main = b.declare("main");
    b.subgraph(main)
        .inputs(&[x])
        .partial("bind_self", main, &[x], h)
        .call("recurse", h, &[r])
        .kernel("negate", KernelOp::Neg, &[r], &[out])
        .returns(&[out])
        .finish();
    b.build(main)
}

/// Builds an acyclic program: subgraph `i` only ever calls subgraphs `j > i`.
pub fn random_program(seed: u64) -> Result<SampleProgram> {
    const SHAPE: [usize; 1] = [4];
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut b = ProgramBuilder::new();

    let count = rng.usize(2..=5);
    let ids: Vec<_> = (0..count)
        .map(|index| b.declare(&format!("sg{}", index)))
        .collect();
    let formals: Vec<Vec<TensorId>> = (0..count)
        .map(|index| {
            (0..rng.usize(1..=2))
                .map(|slot| b.tensor(&format!("sg{}_in{}", index, slot), &SHAPE))
                .collect()
        })
        .collect();

    for index in (0..count).rev() {
        let mut live = formals[index].clone();
        let mut sg = b.subgraph(ids[index]).inputs(&formals[index]);
        let steps = rng.usize(1..=4);
        for step in 0..steps {
            let prefix = format!("sg{}_s{}", index, step);
            if index + 1 < count && rng.bool() {
                let callee = rng.usize(index + 1..count);
                let args: Vec<TensorId> = formals[callee]
                    .iter()
                    .map(|_| live[rng.usize(..live.len())])
                    .collect();
                let handle = sg.tensor(&format!("{}_h", prefix), &[]);
                let result = sg.tensor(&format!("{}_r", prefix), &SHAPE);
                sg = sg
                    .partial(&format!("{}_bind", prefix), ids[callee], &args, handle)
                    .call(&format!("{}_call", prefix), handle, &[result]);
                live.push(result);
            } else {
                let op = match rng.usize(0..4) {
                    0 => KernelOp::Add,
                    1 => KernelOp::Sub,
                    2 => KernelOp::Mul,
                    _ => KernelOp::Neg,
                };
                let arity = op.arity().unwrap_or(1);
                let operands: Vec<TensorId> =
                    (0..arity).map(|_| live[rng.usize(..live.len())]).collect();
                let result = sg.tensor(&format!("{}_y", prefix), &SHAPE);
                sg = sg.kernel(&format!("{}_{}", prefix, op.as_str()), op, &operands, &[result]);
                live.push(result);
            }
        }
        let result = live[live.len() - 1];
        sg.returns(&[result]).finish();
    }

    let program = b.build(ids[0])?;
    let inputs = deterministic_inputs(&program, seed);
    Ok(SampleProgram {
        name: format!("random-{}", seed),
        description: format!("random acyclic program ({} subgraphs)", count),
        program,
        inputs,
        expect_rejection: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_validate_and_have_unique_names() {
        let samples = samples().unwrap();
        let mut names: Vec<_> = samples.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), samples.len());
        for sample in &samples {
            sample.program.validate().unwrap();
            assert_eq!(sample.inputs.len(), sample.program.entry_inputs().len());
        }
    }

    #[test]
    fn random_programs_are_reproducible() {
        let first = random_program(11).unwrap();
        let second = random_program(11).unwrap();
        assert_eq!(first.program, second.program);
        assert_eq!(first.inputs, second.inputs);
    }
}
