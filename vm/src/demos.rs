//! Small programs assembled with the module builder.
//!
//! The CLI runs them by name and the benches time them. Each builder
//! returns the module together with the index of its entry method.

use bytecode::{BuildError, MethodBuilder, Module, ModuleBuilder, Op, TypeDefKind};

pub type DemoFn = fn() -> Result<(Module, u32), BuildError>;

#[derive(Debug, Clone, Copy)]
pub struct Demo {
    pub name: &'static str,
    pub about: &'static str,
    pub build: DemoFn,
}

impl Demo {
    pub const fn new(name: &'static str, about: &'static str, build: DemoFn) -> Self {
        Self { name, about, build }
    }
}

pub const DEMOS: &[Demo] = &[
    Demo::new("arithmetic", "(1 + 2) * (3 + 4)", arithmetic),
    Demo::new("branching", "max(3, 9) through a conditional branch", branching),
    Demo::new("loop", "sum of 1..=100", sum_to_hundred),
    Demo::new("arrays", "sum of squares stored in an int[10]", squares_of_ten),
    Demo::new("structs", "squared length of a Point(3, 4)", structs),
    Demo::new("classes", "linked list of three nodes, summed", classes),
    Demo::new("factorial", "recursive 10!", factorial),
    Demo::new("conversion", "int to string and concatenation", conversion),
    Demo::new("print", "hello through system::Print", print),
];

pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

fn program(b: &mut ModuleBuilder) -> u32 {
    b.static_class("Program")
}

fn print_method(b: &mut ModuleBuilder) -> Result<i32, BuildError> {
    let void = b.void();
    let string = b.string();
    let system = b.static_class("system");
    let mut print = MethodBuilder::new("Print", system, void).set_static().set_native();
    print.param("text", string);
    b.add_callable(print)
}

pub fn arithmetic() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let owner = program(&mut b);
    let c: Vec<i32> = (1..=4).map(|v| b.const_i32(v)).collect();

    let mut main = MethodBuilder::new("main", owner, int).set_static();
    main.emit(Op::Ldc, c[0]).emit(Op::Ldc, c[1]).op(Op::Add);
    main.emit(Op::Ldc, c[2]).emit(Op::Ldc, c[3]).op(Op::Add);
    main.op(Op::Mul).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn branching() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let owner = program(&mut b);
    let three = b.const_i32(3);
    let nine = b.const_i32(9);

    let mut max = MethodBuilder::new("max", owner, int).set_static();
    let x = max.param("a", int);
    let y = max.param("b", int);
    let second = max.label();
    max.emit(Op::Ldarg, y).emit(Op::Ldarg, x).op(Op::Cgt).brtrue(second);
    max.emit(Op::Ldarg, x).op(Op::Ret);
    max.bind(second);
    max.emit(Op::Ldarg, y).op(Op::Ret);
    let max = b.add_callable(max)?;

    let mut main = MethodBuilder::new("main", owner, int).set_static();
    main.emit(Op::Ldc, three).emit(Op::Ldc, nine).emit(Op::Call, max).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

fn sum_to_hundred() -> Result<(Module, u32), BuildError> {
    counting_loop(100)
}

fn squares_of_ten() -> Result<(Module, u32), BuildError> {
    fill_array(10)
}

/// Sums `1..=n` with a backwards branch.
pub fn counting_loop(n: i32) -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let owner = program(&mut b);
    let zero = b.const_i32(0);
    let one = b.const_i32(1);
    let limit = b.const_i32(n);

    let mut main = MethodBuilder::new("main", owner, int).set_static();
    let i = main.local("i", int);
    let sum = main.local("sum", int);
    let top = main.label();
    let done = main.label();
    main.emit(Op::Ldc, zero).emit(Op::Stloc, sum);
    main.emit(Op::Ldc, one).emit(Op::Stloc, i);
    main.bind(top);
    main.emit(Op::Ldloc, i).emit(Op::Ldc, limit).op(Op::Cgt).brtrue(done);
    main.emit(Op::Ldloc, sum).emit(Op::Ldloc, i).op(Op::Add).emit(Op::Stloc, sum);
    main.emit(Op::Ldloc, i).emit(Op::Ldc, one).op(Op::Add).emit(Op::Stloc, i);
    main.br(top);
    main.bind(done);
    main.emit(Op::Ldloc, sum).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

/// Stores `i * i` into an array of `n` ints, then sums it back.
pub fn fill_array(n: i32) -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let ints = b.array_of(int);
    let owner = program(&mut b);
    let zero = b.const_i32(0);
    let one = b.const_i32(1);
    let len = b.const_i32(n);

    let mut main = MethodBuilder::new("main", owner, int).set_static();
    let a = main.local("a", ints);
    let i = main.local("i", int);
    let sum = main.local("sum", int);
    main.emit(Op::Ldc, len).emit(Op::Newarr, ints as i32).emit(Op::Stloc, a);

    let fill = main.label();
    let filled = main.label();
    main.emit(Op::Ldc, zero).emit(Op::Stloc, i);
    main.bind(fill);
    main.emit(Op::Ldloc, i).emit(Op::Ldloc, a).op(Op::Ldlen).op(Op::Clt).brfalse(filled);
    main.emit(Op::Ldloc, i).emit(Op::Ldloc, i).op(Op::Mul);
    main.emit(Op::Ldloc, i).emit(Op::Ldloc, a).op(Op::Stelem);
    main.emit(Op::Ldloc, i).emit(Op::Ldc, one).op(Op::Add).emit(Op::Stloc, i);
    main.br(fill);
    main.bind(filled);

    let add = main.label();
    let summed = main.label();
    main.emit(Op::Ldc, zero).emit(Op::Stloc, sum);
    main.emit(Op::Ldc, zero).emit(Op::Stloc, i);
    main.bind(add);
    main.emit(Op::Ldloc, i).emit(Op::Ldloc, a).op(Op::Ldlen).op(Op::Clt).brfalse(summed);
    main.emit(Op::Ldloc, sum);
    main.emit(Op::Ldloc, i).emit(Op::Ldloc, a).op(Op::Ldelem);
    main.op(Op::Add).emit(Op::Stloc, sum);
    main.emit(Op::Ldloc, i).emit(Op::Ldc, one).op(Op::Add).emit(Op::Stloc, i);
    main.br(add);
    main.bind(summed);
    main.emit(Op::Ldloc, sum).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn structs() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let void = b.void();
    let owner = program(&mut b);
    let point = b.composite("Point", TypeDefKind::Struct);
    let fx = b.field(point, "x", int, false);
    let fy = b.field(point, "y", int, false);

    let mut ctor = MethodBuilder::new(".ctor", point, void);
    ctor.param("x", int);
    ctor.param("y", int);
    ctor.emit(Op::Ldarg, 0).op(Op::Ldthis).emit(Op::Stfld, fx);
    ctor.emit(Op::Ldarg, 1).op(Op::Ldthis).emit(Op::Stfld, fy);
    ctor.op(Op::Ret);
    let new_point = b.add_constructor(ctor)?;

    let mut squared = MethodBuilder::new("squared", point, int);
    squared.op(Op::Ldthis).emit(Op::Ldfld, fx).op(Op::Ldthis).emit(Op::Ldfld, fx).op(Op::Mul);
    squared.op(Op::Ldthis).emit(Op::Ldfld, fy).op(Op::Ldthis).emit(Op::Ldfld, fy).op(Op::Mul);
    squared.op(Op::Add).op(Op::Ret);
    let squared = b.add_callable(squared)?;

    let three = b.const_i32(3);
    let four = b.const_i32(4);
    let mut main = MethodBuilder::new("main", owner, int).set_static();
    let p = main.local("p", point);
    main.emit(Op::Ldc, three).emit(Op::Ldc, four).emit(Op::Newobj, new_point);
    main.emit(Op::Stloc, p);
    // struct methods take their receiver by address
    main.emit(Op::Ldtype, point as i32).emit(Op::Ldloca, p).emit(Op::Call, squared);
    main.op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn classes() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let int = b.int();
    let void = b.void();
    let owner = program(&mut b);
    let node = b.composite("Node", TypeDefKind::Class);
    let value = b.field(node, "value", int, false);
    let next = b.field(node, "next", node, false);
    let zero = b.const_i32(0);

    let mut ctor = MethodBuilder::new(".ctor", node, void);
    ctor.param("value", int);
    ctor.param("next", node);
    ctor.emit(Op::Ldarg, 0).op(Op::Ldthis).emit(Op::Stfld, value);
    ctor.emit(Op::Ldarg, 1).op(Op::Ldthis).emit(Op::Stfld, next);
    ctor.op(Op::Ret);
    let new_node = b.add_constructor(ctor)?;

    let mut main = MethodBuilder::new("main", owner, int).set_static();
    let head = main.local("head", node);
    let sum = main.local("sum", int);
    let values: Vec<i32> = [3, 2, 1].iter().map(|&v| b.const_i32(v)).collect();
    for c in values {
        main.emit(Op::Ldc, c).emit(Op::Ldloc, head).emit(Op::Newobj, new_node);
        main.emit(Op::Stloc, head);
    }

    let walk = main.label();
    let done = main.label();
    main.emit(Op::Ldc, zero).emit(Op::Stloc, sum);
    main.bind(walk);
    main.emit(Op::Ldloc, head).brfalse(done);
    main.emit(Op::Ldloc, sum).emit(Op::Ldloc, head).emit(Op::Ldfld, value);
    main.op(Op::Add).emit(Op::Stloc, sum);
    main.emit(Op::Ldloc, head).emit(Op::Ldfld, next).emit(Op::Stloc, head);
    main.br(walk);
    main.bind(done);
    main.emit(Op::Ldloc, sum).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn factorial() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let long = b.primitive(bytecode::PrimitiveKind::I64);
    let owner = program(&mut b);
    let one = b.const_i64(1);
    let ten = b.const_i64(10);

    // the method's own member reference is the first one created
    let mut fact = MethodBuilder::new("fact", owner, long).set_static();
    let n = fact.param("n", long);
    let recurse = fact.label();
    fact.emit(Op::Ldarg, n).emit(Op::Ldc, one).op(Op::Cgt).brtrue(recurse);
    fact.emit(Op::Ldc, one).op(Op::Ret);
    fact.bind(recurse);
    fact.emit(Op::Ldarg, n);
    fact.emit(Op::Ldarg, n).emit(Op::Ldc, one).op(Op::Sub);
    fact.emit(Op::Call, 0).op(Op::Mul).op(Op::Ret);
    let fact = b.add_callable(fact)?;

    let mut main = MethodBuilder::new("main", owner, long).set_static();
    main.emit(Op::Ldc, ten).emit(Op::Call, fact).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn conversion() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let string = b.string();
    let owner = program(&mut b);
    let print = print_method(&mut b)?;
    let label = b.const_string("answer: ");
    let answer = b.const_i32(42);

    let mut main = MethodBuilder::new("main", owner, string).set_static();
    main.emit(Op::Ldstr, label);
    main.emit(Op::Ldc, answer).emit(Op::Conv, string as i32);
    main.op(Op::Add);
    main.emit(Op::Ldstr, label).emit(Op::Ldc, answer).op(Op::Cnct);
    main.emit(Op::Call, print);
    main.op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}

pub fn print() -> Result<(Module, u32), BuildError> {
    let mut b = ModuleBuilder::new();
    let void = b.void();
    let owner = program(&mut b);
    let print = print_method(&mut b)?;
    let hello = b.const_string("hello, world");

    let mut main = MethodBuilder::new("main", owner, void).set_static();
    main.emit(Op::Ldstr, hello).emit(Op::Call, print).op(Op::Ret);
    let main = b.add_method(main)?;
    Ok((b.finish(), main))
}
