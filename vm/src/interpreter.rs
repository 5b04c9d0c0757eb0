use std::sync::Arc;

use bytecode::{Instruction, MethodDefinition, Op};
use log::{debug, error, info, trace};
use object::{Address, BinaryOp, Comparison, Scalar, TypeCategory, TypeId, Value};

use crate::stack::FrameLayout;
use crate::stack_effect::{native_reserve, resolve_stack_size};
use crate::{Runtime, RuntimeError};

/// A request to run one method: which method, the bound instance for
/// instance methods, and one argument per declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub method: u32,
    pub instance: Option<Value>,
    pub arguments: Vec<Value>,
}

impl InvocationRequest {
    pub fn new(method: u32) -> Self {
        Self {
            method,
            instance: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_instance(mut self, instance: Value) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

enum Flow {
    Next,
    Jump(usize),
    Return,
}

fn arithmetic(op: Op) -> Option<BinaryOp> {
    Some(match op {
        Op::Add => BinaryOp::Add,
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        Op::Div => BinaryOp::Div,
        Op::Mod => BinaryOp::Rem,
        Op::Or => BinaryOp::Or,
        Op::And => BinaryOp::And,
        Op::Xor => BinaryOp::Xor,
        Op::Shl => BinaryOp::Shl,
        Op::Shr => BinaryOp::Shr,
        _ => return None,
    })
}

fn comparison(op: Op) -> Option<Comparison> {
    Some(match op {
        Op::Ceq => Comparison::Eq,
        Op::Cne => Comparison::Ne,
        Op::Cgt => Comparison::Gt,
        Op::Cge => Comparison::Ge,
        Op::Clt => Comparison::Lt,
        Op::Cle => Comparison::Le,
        _ => return None,
    })
}

fn branch_target(operand: i32, len: usize) -> Result<usize, RuntimeError> {
    match usize::try_from(operand) {
        Ok(target) if target <= len => Ok(target),
        _ => Err(RuntimeError::BranchOutOfRange { target: operand }),
    }
}

impl Runtime {
    /// Runs a method to completion and returns its result, placed in the
    /// caller's frame.
    ///
    /// The callee's frame is popped on every path, including faults.
    pub fn invoke(
        &mut self,
        request: InvocationRequest,
    ) -> Result<Option<Value>, RuntimeError> {
        let module = Arc::clone(&self.module);
        let def = module
            .method(request.method as usize)
            .ok_or(RuntimeError::UnknownMethod(request.method))?;
        let name = self.qualified_name(def);
        self.check_request(def, &name, &request)?;

        info!("invoking method '{name}'");
        if def.is_native {
            return self.invoke_native(def, &name, request);
        }

        self.enter_frame(def, &name, request.method, request.instance)?;
        let outcome = self
            .execute(def, &name, &request.arguments)
            .and_then(|result| self.capture(result));
        self.leave_frame(outcome)
    }

    fn check_request(
        &self,
        def: &MethodDefinition,
        name: &str,
        request: &InvocationRequest,
    ) -> Result<(), RuntimeError> {
        match (def.is_static, request.instance.is_some()) {
            (true, true) => {
                return Err(RuntimeError::UnexpectedInstance {
                    method: name.to_string(),
                });
            }
            (false, false) => {
                return Err(RuntimeError::MissingInstance {
                    method: name.to_string(),
                });
            }
            _ => {}
        }
        if def.parameters.len() != request.arguments.len() {
            return Err(RuntimeError::ArgumentCountMismatch {
                method: name.to_string(),
                expected: def.parameters.len(),
                got: request.arguments.len(),
            });
        }
        // frames beyond the host frame, counting the one about to be pushed
        if self.stack.depth() > self.settings.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded {
                limit: self.settings.max_call_depth,
            });
        }
        Ok(())
    }

    /// Pushes a frame sized for `def`: its slots, the resolved evaluation
    /// bytes and any native reserve.
    #[inline(never)]
    fn enter_frame(
        &mut self,
        def: &MethodDefinition,
        name: &str,
        method: u32,
        instance: Option<Value>,
    ) -> Result<(), RuntimeError> {
        let size = resolve_stack_size(self, method)?;
        let reserve = native_reserve(self, method)?;
        let locals = self.slot_layout(def.locals.iter().map(|l| l.ty))?;
        let arguments = self.slot_layout(def.parameters.iter().map(|p| p.ty))?;
        let slots: usize = locals.iter().chain(&arguments).map(|&(_, n)| n).sum();
        debug!(
            "frame for '{name}': {slots} slot bytes, {} eval bytes, {reserve} native bytes",
            size.max_stack_size
        );
        self.stack.allocate_frame(FrameLayout {
            method: Some(method),
            total_size: slots + size.max_stack_size + reserve,
            max_depth: size.max_stack,
            instance,
            locals,
            arguments,
        })?;
        Ok(())
    }

    /// Pops the active frame, moves the captured result into the caller
    /// and releases what only the popped frame held.
    #[inline(never)]
    fn leave_frame(
        &mut self,
        outcome: Result<Option<(Value, Vec<u8>)>, RuntimeError>,
    ) -> Result<Option<Value>, RuntimeError> {
        let released = self.frame_references();
        self.stack.deallocate_frame()?;
        let (result, released) = (outcome?, released?);

        let result = match result {
            Some((value, bytes)) => Some(self.rehome(value, &bytes)?),
            None => None,
        };
        if let Some(value) = result {
            self.pin(value);
        }
        let swept = self.release_unreferenced(released);
        if result.is_some() {
            self.unpin();
        }
        swept?;
        Ok(result)
    }

    fn qualified_name(&self, def: &MethodDefinition) -> String {
        match self.type_name(def.owner) {
            Ok(owner) => format!("{owner}::{}", def.name),
            Err(_) => def.name.clone(),
        }
    }

    fn slot_layout(
        &self,
        types: impl Iterator<Item = u32>,
    ) -> Result<Vec<(TypeId, usize)>, RuntimeError> {
        types
            .map(|def_index| {
                let ty = self.types.get_type(def_index)?;
                Ok((ty, self.descriptor(ty).size))
            })
            .collect()
    }

    fn invoke_native(
        &mut self,
        def: &MethodDefinition,
        name: &str,
        request: InvocationRequest,
    ) -> Result<Option<Value>, RuntimeError> {
        let owner = self.type_name(def.owner)?;
        let native = *self.natives.lookup(owner, &def.name).ok_or_else(|| {
            RuntimeError::UnknownNative {
                type_name: owner.to_string(),
                method: def.name.clone(),
            }
        })?;
        if request.arguments.len() != native.arity as usize {
            return Err(RuntimeError::Native {
                method: name.to_string(),
                message: format!(
                    "expects {} arguments, got {}",
                    native.arity,
                    request.arguments.len()
                ),
            });
        }
        let result = (native.func)(self, request.instance, &request.arguments)?;
        let returns = !self.descriptor(self.types.get_type(def.return_type)?).is_void();
        match (returns, result) {
            (true, None) => Err(RuntimeError::Native {
                method: name.to_string(),
                message: "returned nothing from a non-void method".to_string(),
            }),
            (false, Some(_)) => Err(RuntimeError::Native {
                method: name.to_string(),
                message: "returned a value from a void method".to_string(),
            }),
            _ => Ok(result),
        }
    }

    /// Binds arguments and runs the body against the active frame.
    fn execute(
        &mut self,
        def: &MethodDefinition,
        name: &str,
        arguments: &[Value],
    ) -> Result<Option<Value>, RuntimeError> {
        for (idx, argument) in arguments.iter().enumerate() {
            let slot = self.stack.current()?.argument(idx as i32)?;
            self.store(slot.addr, slot.ty, *argument)?;
        }

        let body = &def.body;
        let mut label = 0;
        while label < body.len() {
            let insn = body[label];
            trace!("{name}@{label}: {insn}");
            // guest recursion passes through here, not through `step`
            let flow = match insn.op {
                Op::Call => self.call(insn.operand).map(|()| Flow::Next),
                Op::Newobj => self.construct(insn.operand).map(|()| Flow::Next),
                _ => self.step(def, insn),
            };
            match flow {
                Ok(Flow::Next) => label += 1,
                Ok(Flow::Jump(target)) => label = target,
                Ok(Flow::Return) => break,
                Err(err) => {
                    if !matches!(err, RuntimeError::Fault { .. }) {
                        error!(
                            "{name}@{label}: {} {} failed: {err}",
                            insn.op.mnemonic(),
                            insn.operand
                        );
                    }
                    return Err(RuntimeError::Fault {
                        method: name.to_string(),
                        index: label,
                        instruction: insn,
                        error: Box::new(err),
                    });
                }
            }
        }

        let depth = self.stack.current()?.depth();
        let returns = !self.descriptor(self.types.get_type(def.return_type)?).is_void();
        match (returns, depth) {
            (false, 0) => Ok(None),
            (false, remaining) => Err(RuntimeError::VoidReturnWithValues { remaining }),
            (true, 0) => Err(RuntimeError::EmptyStackOnReturn),
            (true, 1) => self.pop().map(Some),
            (true, remaining) => Err(RuntimeError::StackNotDrained { remaining }),
        }
    }

    /// Saves the bytes of an inline result before its frame goes away.
    fn capture(
        &self,
        result: Option<Value>,
    ) -> Result<Option<(Value, Vec<u8>)>, RuntimeError> {
        result
            .map(|value| match value {
                Value::Primitive { .. } | Value::Struct { .. } => {
                    Ok((value, self.value_bytes(value)?))
                }
                other => Ok((other, Vec::new())),
            })
            .transpose()
    }

    /// Gives a captured inline result fresh storage in the now active frame.
    fn rehome(&mut self, value: Value, bytes: &[u8]) -> Result<Value, RuntimeError> {
        match value {
            Value::Primitive { ty, .. } => {
                let addr = self.allocate(bytes.len())?;
                self.write(addr, bytes)?;
                Ok(Value::Primitive { ty, addr })
            }
            Value::Struct { ty, .. } => {
                let addr = self.allocate(bytes.len())?;
                self.write(addr, bytes)?;
                Ok(Value::Struct { ty, addr })
            }
            other => Ok(other),
        }
    }

    /// Heap objects referenced from the active frame's locals and
    /// evaluation stack.
    fn frame_references(&self) -> Result<Vec<Address>, RuntimeError> {
        let frame = self.stack.current()?;
        let mut found = Vec::new();
        for slot in frame.locals() {
            found.extend(self.references_in(slot.addr, slot.ty)?);
        }
        for value in frame.values() {
            found.extend(self.owned_targets(*value)?);
        }
        Ok(found)
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    #[inline(never)]
    fn step(&mut self, def: &MethodDefinition, insn: Instruction) -> Result<Flow, RuntimeError> {
        let operand = insn.operand;
        match insn.op {
            Op::Nop => {}

            op if op.is_binary_arithmetic() => self.binary(op)?,
            op if op.is_comparison() => self.compare(op)?,
            Op::Neg => {
                let value = self.pop()?;
                let Value::Primitive { ty, .. } = value else {
                    return Err(RuntimeError::unexpected("primitive", value));
                };
                let negated = self.read_scalar(value)?.negate()?;
                let result = self.allocate_primitive(ty, negated)?;
                self.push(result)?;
                self.deallocate_if_dead(value)?;
            }

            Op::Ldc => {
                let value = self.allocate_constant(operand)?;
                self.push(value)?;
            }
            Op::Ldstr => {
                let value = self.allocate_constant(operand)?;
                if !matches!(value, Value::String { .. }) {
                    return Err(RuntimeError::unexpected("string", value));
                }
                self.push(value)?;
            }
            Op::Lddft => {
                let ty = self.type_operand(operand)?;
                let value = self.allocate_object(ty)?;
                self.push(value)?;
            }
            Op::Ldlen => {
                let array = self.pop()?;
                let len = self.array_length(array)?;
                let result = self.allocate_scalar(Scalar::I32(len as i32))?;
                self.push(result)?;
                self.deallocate_if_dead(array)?;
            }

            Op::Ldloc => {
                let slot = self.stack.current()?.local(operand)?;
                let value = self.load(slot.ty, slot.addr)?;
                self.push(value)?;
            }
            Op::Stloc => {
                let value = self.pop()?;
                self.set_local(operand, value)?;
                self.deallocate_if_dead(value)?;
            }
            Op::Ldarg => {
                let slot = self.stack.current()?.argument(operand)?;
                let value = self.load(slot.ty, slot.addr)?;
                self.push(value)?;
            }
            Op::Starg => {
                let value = self.pop()?;
                self.set_argument(operand, value)?;
                self.deallocate_if_dead(value)?;
            }
            Op::Ldfld => {
                let instance = self.pop()?;
                let (_, field) = self.resolve_field(operand, false)?;
                let addr = self.field_address(instance, &field)?;
                let value = self.load(field.ty, addr)?;
                self.push(value)?;
                self.deallocate_if_dead(instance)?;
            }
            Op::Stfld => {
                let instance = self.pop()?;
                let value = self.pop()?;
                let (_, field) = self.resolve_field(operand, false)?;
                let addr = self.field_address(instance, &field)?;
                self.assign(addr, field.ty, value)?;
                self.deallocate_if_dead(value)?;
                self.deallocate_if_dead(instance)?;
            }
            Op::Ldsfld => {
                let (owner, field) = self.resolve_field(operand, true)?;
                let addr = self.static_field_address(owner, &field)?;
                let value = self.load(field.ty, addr)?;
                self.push(value)?;
            }
            Op::Stsfld => {
                let value = self.pop()?;
                let (owner, field) = self.resolve_field(operand, true)?;
                let addr = self.static_field_address(owner, &field)?;
                self.assign(addr, field.ty, value)?;
                self.deallocate_if_dead(value)?;
            }
            Op::Ldthis => {
                let instance = self.stack.current()?.instance().ok_or(RuntimeError::NoInstance)?;
                self.push(instance)?;
            }

            Op::Ldelem => {
                let array = self.pop()?;
                let index = self.pop()?;
                let (addr, element) = self.element_address(array, self.read_index(index)?)?;
                let value = self.load(element, addr)?;
                self.push(value)?;
                self.deallocate_if_dead(array)?;
            }
            Op::Stelem => {
                let array = self.pop()?;
                let index = self.pop()?;
                let value = self.pop()?;
                let (addr, element) = self.element_address(array, self.read_index(index)?)?;
                self.assign(addr, element, value)?;
                self.deallocate_if_dead(value)?;
                self.deallocate_if_dead(array)?;
            }

            // address-of: the pushed pointer keeps a heap target alive
            Op::Ldflda => {
                let pointee = self.pop_token(insn.op)?;
                let instance = self.pop()?;
                let (_, field) = self.resolve_field(operand, false)?;
                let target = self.field_address(instance, &field)?;
                self.push(self.allocate_pointer(pointee, target))?;
                self.deallocate_if_dead(instance)?;
            }
            Op::Ldsflda => {
                let pointee = self.pop_token(insn.op)?;
                let (owner, field) = self.resolve_field(operand, true)?;
                let target = self.static_field_address(owner, &field)?;
                self.push(self.allocate_pointer(pointee, target))?;
            }
            Op::Ldloca => {
                let pointee = self.pop_token(insn.op)?;
                let target = self.local_address(operand)?;
                self.push(self.allocate_pointer(pointee, target))?;
            }
            Op::Ldarga => {
                let pointee = self.pop_token(insn.op)?;
                let target = self.argument_address(operand)?;
                self.push(self.allocate_pointer(pointee, target))?;
            }
            Op::Ldelema => {
                let array = self.pop()?;
                let index = self.pop()?;
                let pointee = self.pop_token(insn.op)?;
                let (target, _) = self.element_address(array, self.read_index(index)?)?;
                self.push(self.allocate_pointer(pointee, target))?;
                self.deallocate_if_dead(array)?;
            }
            Op::Ldind => {
                let pointer = self.pop()?;
                let Value::Pointer { target, .. } = pointer else {
                    return Err(RuntimeError::unexpected("pointer", pointer));
                };
                let ty = self.type_operand(operand)?;
                let value = self.load(ty, target)?;
                self.push(value)?;
                self.deallocate_if_dead(pointer)?;
            }
            Op::Stind => {
                let pointer = self.pop()?;
                let value = self.pop()?;
                let Value::Pointer { target, .. } = pointer else {
                    return Err(RuntimeError::unexpected("pointer", pointer));
                };
                let ty = self.type_operand(operand)?;
                self.assign(target, ty, value)?;
                self.deallocate_if_dead(value)?;
                self.deallocate_if_dead(pointer)?;
            }
            Op::Ldtype => {
                let token = self.allocate_scalar(Scalar::I32(operand))?;
                self.push(token)?;
            }

            Op::Conv => {
                let value = self.pop()?;
                let ty = self.type_operand(operand)?;
                let converted = self.convert(value, ty)?;
                self.push(converted)?;
                self.deallocate_if_dead(value)?;
            }
            Op::Newarr => {
                let length = self.pop()?;
                let ty = self.type_operand(operand)?;
                let n = self.read_index(length)?;
                if n < 0 {
                    return Err(RuntimeError::NegativeArrayLength(n));
                }
                let n = u32::try_from(n).map_err(|_| heap::HeapError::OutOfMemory {
                    requested: n as usize,
                    limit: self.heap.settings().max_size,
                })?;
                let array = self.allocate_array(ty, n)?;
                self.push(array)?;
            }
            Op::Ret => return Ok(Flow::Return),

            Op::Br => return Ok(Flow::Jump(branch_target(operand, def.body.len())?)),
            Op::Brtrue | Op::Brfalse => {
                let target = branch_target(operand, def.body.len())?;
                let condition = self.pop()?;
                let truthy = self.is_truthy(condition)?;
                self.deallocate_if_dead(condition)?;
                if truthy == (insn.op == Op::Brtrue) {
                    return Ok(Flow::Jump(target));
                }
            }

            op => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: op.mnemonic(),
                    operand: "interpreter".to_string(),
                });
            }
        }
        Ok(Flow::Next)
    }

    fn type_operand(&self, operand: i32) -> Result<TypeId, RuntimeError> {
        let idx = u32::try_from(operand).map_err(|_| RuntimeError::UnknownTypeRef(operand))?;
        Ok(self.types.get_type(idx)?)
    }

    /// Pops the `int` pushed by `ldtype` and returns the type it names.
    fn pop_token(&mut self, op: Op) -> Result<TypeId, RuntimeError> {
        let token = self.pop().map_err(|_| RuntimeError::MissingTypeToken { op })?;
        let is_int = matches!(token, Value::Primitive { ty, .. } if ty == self.types.builtins().int());
        if !is_int {
            return Err(RuntimeError::MissingTypeToken { op });
        }
        let idx = self.read_index(token)?;
        self.type_operand(idx as i32)
    }

    fn is_truthy(&self, value: Value) -> Result<bool, RuntimeError> {
        match value {
            Value::Primitive { .. } => Ok(self.read_scalar(value)?.is_truthy()),
            Value::Struct { .. } => Err(RuntimeError::unexpected("condition", value)),
            other => Ok(!other.location().is_null()),
        }
    }

    fn text_of(&self, value: Value) -> Result<String, RuntimeError> {
        match value {
            Value::String { .. } => self.read_string(value),
            Value::Primitive { .. } => Ok(self.read_scalar(value)?.to_string()),
            other => Err(RuntimeError::unexpected("string or primitive", other)),
        }
    }

    fn binary(&mut self, op: Op) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match (op, left, right) {
            (Op::Cnct, ..) | (Op::Add, Value::String { .. }, _) => {
                let mut text = self.text_of(left)?;
                text.push_str(&self.text_of(right)?);
                self.allocate_string(&text)?
            }
            (_, Value::Primitive { ty, .. }, Value::Primitive { .. }) => {
                let binop = arithmetic(op).ok_or(RuntimeError::UnsupportedOperation {
                    op: op.mnemonic(),
                    operand: "primitive".to_string(),
                })?;
                let value = self.read_scalar(left)?.binary(binop, self.read_scalar(right)?)?;
                self.allocate_primitive(ty, value)?
            }
            _ => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: op.mnemonic(),
                    operand: format!("{} and {}", left.kind_name(), right.kind_name()),
                });
            }
        };
        self.push(result)?;
        self.deallocate_if_dead(left)?;
        self.deallocate_if_dead(right)
    }

    fn compare(&mut self, op: Op) -> Result<(), RuntimeError> {
        let cmp = comparison(op).ok_or(RuntimeError::UnsupportedOperation {
            op: op.mnemonic(),
            operand: "comparison".to_string(),
        })?;
        let right = self.pop()?;
        let left = self.pop()?;
        let equal_wanted = matches!(cmp, Comparison::Eq);
        let holds = match (left, right) {
            (Value::Primitive { .. }, Value::Primitive { .. }) => {
                self.read_scalar(left)?.compare(cmp, self.read_scalar(right)?)?
            }
            (Value::String { target: a, .. }, Value::String { target: b, .. })
                if !a.is_null() && !b.is_null() =>
            {
                let ordering = self.read_string(left)?.cmp(&self.read_string(right)?);
                cmp.holds(Some(ordering))
            }
            (Value::Struct { .. }, Value::Struct { .. }) if cmp.is_equality() => {
                (self.value_bytes(left)? == self.value_bytes(right)?) == equal_wanted
            }
            (l, r) if l.is_address_valued() && r.is_address_valued() && cmp.is_equality() => {
                (l.location() == r.location()) == equal_wanted
            }
            _ => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: op.mnemonic(),
                    operand: format!("{} and {}", left.kind_name(), right.kind_name()),
                });
            }
        };
        let result = self.allocate_scalar(Scalar::Bool(holds))?;
        self.push(result)?;
        self.deallocate_if_dead(left)?;
        self.deallocate_if_dead(right)
    }

    /// Numeric to string when the target is `string`; otherwise a raw
    /// reinterpretation of the source bytes, truncated or zero-extended to
    /// the target size.
    fn convert(&mut self, value: Value, ty: TypeId) -> Result<Value, RuntimeError> {
        let (is_string, size) = {
            let target = self.descriptor(ty);
            (target.is_string(), target.size)
        };
        if is_string {
            match value {
                Value::Primitive { .. } => {
                    let text = self.read_scalar(value)?.to_string();
                    return self.allocate_string(&text);
                }
                Value::String { .. } => return Ok(value),
                _ => {}
            }
        }
        let bytes = self.value_bytes(value)?;
        let addr = self.allocate(size)?;
        let n = size.min(bytes.len());
        if n > 0 {
            self.write(addr, &bytes[..n])?;
        }
        self.materialize(ty, addr)
    }

    fn pop_arguments(&mut self, count: usize) -> Result<Vec<Value>, RuntimeError> {
        let mut arguments = Vec::with_capacity(count);
        for _ in 0..count {
            arguments.push(self.pop()?);
        }
        arguments.reverse();
        Ok(arguments)
    }

    fn construct(&mut self, type_ref: i32) -> Result<(), RuntimeError> {
        let (ty, ctor) = self.constructor(type_ref)?;
        let arity = self.method_def(ctor)?.parameters.len();
        let arguments = self.pop_arguments(arity)?;
        let instance = match self.descriptor(ty).category {
            TypeCategory::Struct | TypeCategory::Class => self.allocate_object(ty)?,
            _ => return Err(RuntimeError::NotConstructible(self.descriptor(ty).name.clone())),
        };

        self.pin(instance);
        let result = self.invoke(
            InvocationRequest::new(ctor)
                .with_instance(instance)
                .with_arguments(arguments.clone()),
        );
        self.unpin();
        let result = result?;

        self.push(instance)?;
        if let Some(returned) = result
            && returned != instance
        {
            self.deallocate_if_dead(returned)?;
        }
        for argument in arguments {
            self.deallocate_if_dead(argument)?;
        }
        Ok(())
    }

    fn call(&mut self, member: i32) -> Result<(), RuntimeError> {
        let method = self.resolve_method(member)?;
        let (arity, is_static) = {
            let def = self.method_def(method)?;
            (def.parameters.len(), def.is_static)
        };
        let receiver = if is_static { None } else { Some(self.pop()?) };
        let instance = receiver.map(|receiver| match receiver {
            Value::Pointer { pointee, target } if self.descriptor(pointee).is_struct() => {
                Value::Struct {
                    ty: pointee,
                    addr: target,
                }
            }
            other => other,
        });
        let arguments = self.pop_arguments(arity)?;

        let mut request = InvocationRequest::new(method).with_arguments(arguments.clone());
        request.instance = instance;
        // a struct view does not hold the object its pointer pointed into
        let pinned = matches!(receiver, Some(Value::Pointer { .. }));
        if let Some(receiver) = receiver.filter(|_| pinned) {
            self.pin(receiver);
        }
        let result = self.invoke(request);
        if pinned {
            self.unpin();
        }
        if let Some(result) = result? {
            self.push(result)?;
        }
        for argument in arguments {
            self.deallocate_if_dead(argument)?;
        }
        if let Some(receiver) = receiver {
            self.deallocate_if_dead(receiver)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytecode::{MethodBuilder, ModuleBuilder, Op, PrimitiveKind, TypeDefKind};
    use heap::HeapError;
    use object::{Scalar, Value};

    use super::*;
    use crate::RuntimeSettings;

    fn runtime(b: ModuleBuilder) -> Runtime {
        Runtime::new(b.finish(), RuntimeSettings::default()).unwrap()
    }

    fn run(b: ModuleBuilder, main: u32) -> (Runtime, Result<Option<Value>, RuntimeError>) {
        let mut rt = runtime(b);
        let result = rt.invoke(InvocationRequest::new(main));
        (rt, result)
    }

    fn run_scalar(b: ModuleBuilder, main: u32) -> Scalar {
        let (rt, result) = run(b, main);
        let value = result.unwrap().expect("a return value");
        rt.read_scalar(value).unwrap()
    }

    fn static_main(b: &mut ModuleBuilder, ret: u32) -> MethodBuilder {
        let program = b.static_class("Program");
        MethodBuilder::new("main", program, ret).set_static()
    }

    // ── Arithmetic and control flow ───────────────────────────────────

    #[test]
    fn adds_two_constants() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let five = b.const_i32(5);
        let seven = b.const_i32(7);
        let mut m = static_main(&mut b, int);
        m.emit(Op::Ldc, five).emit(Op::Ldc, seven).op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(12));
    }

    #[test]
    fn nested_expression_fits_resolved_depth() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let c: Vec<i32> = [1, 2, 3, 4].iter().map(|&v| b.const_i32(v)).collect();
        let mut m = static_main(&mut b, int);
        m.emit(Op::Ldc, c[0]).emit(Op::Ldc, c[1]).op(Op::Add);
        m.emit(Op::Ldc, c[2]).emit(Op::Ldc, c[3]).op(Op::Add);
        m.op(Op::Mul).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let mut rt = runtime(b);
        let size = resolve_stack_size(&rt, main).unwrap();
        assert_eq!(size.max_stack, 3);
        let value = rt.invoke(InvocationRequest::new(main)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(21));
    }

    #[test]
    fn conditional_branch_selects_second_arm() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let one = b.const_i32(1);
        let two = b.const_i32(2);
        let yes = b.const_bool(true);
        let mut m = static_main(&mut b, int);
        let taken = m.label();
        m.emit(Op::Ldc, yes).brtrue(taken);
        m.emit(Op::Ldc, one).op(Op::Ret);
        m.bind(taken);
        m.emit(Op::Ldc, two).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(2));
    }

    #[test]
    fn counting_loop_sums() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let zero = b.const_i32(0);
        let one = b.const_i32(1);
        let ten = b.const_i32(10);
        let mut m = static_main(&mut b, int);
        let i = m.local("i", int);
        let sum = m.local("sum", int);
        let top = m.label();
        let done = m.label();
        m.emit(Op::Ldc, zero).emit(Op::Stloc, sum);
        m.emit(Op::Ldc, one).emit(Op::Stloc, i);
        m.bind(top);
        m.emit(Op::Ldloc, i).emit(Op::Ldc, ten).op(Op::Cgt).brtrue(done);
        m.emit(Op::Ldloc, sum).emit(Op::Ldloc, i).op(Op::Add).emit(Op::Stloc, sum);
        m.emit(Op::Ldloc, i).emit(Op::Ldc, one).op(Op::Add).emit(Op::Stloc, i);
        m.br(top);
        m.bind(done);
        m.emit(Op::Ldloc, sum).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(55));
    }

    #[test]
    fn branch_past_the_end_faults() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let mut m = static_main(&mut b, void);
        m.emit(Op::Br, 10).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (_, result) = run(b, main);
        assert_eq!(
            result.unwrap_err().root_cause(),
            &RuntimeError::BranchOutOfRange { target: 10 }
        );
    }

    #[test]
    fn fault_reports_location_and_pops_the_frame() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let one = b.const_i32(1);
        let zero = b.const_i32(0);
        let mut m = static_main(&mut b, int);
        m.emit(Op::Ldc, one).emit(Op::Ldc, zero).op(Op::Div).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        match result.unwrap_err() {
            RuntimeError::Fault {
                method,
                index,
                instruction,
                error,
            } => {
                assert_eq!(method, "Program::main");
                assert_eq!(index, 2);
                assert_eq!(instruction.op, Op::Div);
                assert_eq!(*error, RuntimeError::DivisionByZero);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(rt.stack.depth(), 1);
    }

    #[test]
    fn underflow_is_rejected_before_running() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let mut m = static_main(&mut b, int);
        m.op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        assert_eq!(result.unwrap_err().root_cause(), &RuntimeError::EvalStackUnderflow);
        assert_eq!(rt.stack.depth(), 1);
    }

    // ── Return contract ───────────────────────────────────────────────

    #[test]
    fn non_void_return_needs_exactly_one_value() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let void = b.void();
        let one = b.const_i32(1);
        let program = b.static_class("Program");

        let mut empty = MethodBuilder::new("empty", program, int).set_static();
        empty.op(Op::Ret);
        let empty = b.add_method(empty).unwrap();

        let mut two = MethodBuilder::new("two", program, int).set_static();
        two.emit(Op::Ldc, one).emit(Op::Ldc, one).op(Op::Ret);
        let two = b.add_method(two).unwrap();

        let mut leftover = MethodBuilder::new("leftover", program, void).set_static();
        leftover.emit(Op::Ldc, one);
        let leftover = b.add_method(leftover).unwrap();

        let mut rt = runtime(b);
        assert_eq!(
            rt.invoke(InvocationRequest::new(empty)),
            Err(RuntimeError::EmptyStackOnReturn)
        );
        assert_eq!(
            rt.invoke(InvocationRequest::new(two)),
            Err(RuntimeError::StackNotDrained { remaining: 2 })
        );
        // falling off the end counts as a return
        assert_eq!(
            rt.invoke(InvocationRequest::new(leftover)),
            Err(RuntimeError::VoidReturnWithValues { remaining: 1 })
        );
        assert_eq!(rt.stack.depth(), 1);
    }

    #[test]
    fn invocation_contract_is_checked() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let void = b.void();
        let thing = b.composite("Thing", TypeDefKind::Class);
        let mut inst = MethodBuilder::new("poke", thing, void);
        inst.param("n", int);
        inst.op(Op::Ret);
        let poke = b.add_method(inst).unwrap();
        let mut m = static_main(&mut b, void);
        m.op(Op::Ldthis).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let mut rt = runtime(b);
        let n = rt.allocate_scalar(Scalar::I32(1)).unwrap();
        assert!(matches!(
            rt.invoke(InvocationRequest::new(poke).with_arguments(vec![n])),
            Err(RuntimeError::MissingInstance { .. })
        ));
        let ty = rt.types.find("Thing").unwrap();
        let obj = rt.allocate_object(ty).unwrap();
        assert!(matches!(
            rt.invoke(InvocationRequest::new(poke).with_instance(obj)),
            Err(RuntimeError::ArgumentCountMismatch { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            rt.invoke(InvocationRequest::new(main).with_instance(obj)),
            Err(RuntimeError::UnexpectedInstance { .. })
        ));
        assert_eq!(
            rt.invoke(InvocationRequest::new(main)).unwrap_err().root_cause(),
            &RuntimeError::NoInstance
        );
    }

    // ── Fields, arrays, pointers ──────────────────────────────────────

    #[test]
    fn static_field_round_trip() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let value = b.const_i32(99);
        let mut m = static_main(&mut b, int);
        let program = b.module().find_type("Program").unwrap();
        let counter = b.field(program, "counter", int, true);
        m.emit(Op::Ldc, value).emit(Op::Stsfld, counter);
        m.emit(Op::Ldsfld, counter).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(99));
    }

    #[test]
    fn array_store_and_load() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let three = b.const_i32(3);
        let one = b.const_i32(1);
        let answer = b.const_i32(42);
        let mut m = static_main(&mut b, int);
        let a = m.local("a", ints);
        m.emit(Op::Ldc, three).emit(Op::Newarr, ints as i32).emit(Op::Stloc, a);
        m.emit(Op::Ldc, answer).emit(Op::Ldc, one).emit(Op::Ldloc, a).op(Op::Stelem);
        m.emit(Op::Ldc, one).emit(Op::Ldloc, a).op(Op::Ldelem);
        m.emit(Op::Ldloc, a).op(Op::Ldlen).op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(45));
        // the array only lived in main's local
        assert_eq!(rt.heap.stats().live_objects, 0);
    }

    #[test]
    fn array_layout_is_length_prefixed() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let mut rt = runtime(b);
        let ty = rt.types.get_type(ints).unwrap();
        let array = rt.allocate_array(ty, 3).unwrap();
        let target = array.location();
        assert_eq!(rt.heap.get_object(target).unwrap().size, 4 + 3 * 4);
        assert_eq!(rt.read(target, 4).unwrap(), &3u32.to_le_bytes());
        assert_eq!(rt.read(target.add(4), 12).unwrap(), &[0u8; 12]);
        assert_eq!(rt.array_length(array).unwrap(), 3);
        let (second, element) = rt.element_address(array, 1).unwrap();
        assert_eq!(second, target.add(4 + 4));
        assert_eq!(element, rt.types.builtins().int());
    }

    #[test]
    fn negative_array_length_faults() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let minus = b.const_i32(-2);
        let mut m = static_main(&mut b, ints);
        m.emit(Op::Ldc, minus).emit(Op::Newarr, ints as i32).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (_, result) = run(b, main);
        assert_eq!(
            result.unwrap_err().root_cause(),
            &RuntimeError::NegativeArrayLength(-2)
        );
    }

    #[test]
    fn elements_outside_the_allocation_are_refused() {
        let mut b = ModuleBuilder::new();
        let long = b.primitive(PrimitiveKind::I64);
        let longs = b.array_of(long);
        let mut rt = runtime(b);
        let ty = rt.types.get_type(longs).unwrap();
        let array = rt.allocate_array(ty, 2).unwrap();

        assert!(rt.element_address(array, 1).is_ok());
        for index in [2, 1 << 60, i64::MAX, -1] {
            assert_eq!(
                rt.element_address(array, index),
                Err(RuntimeError::Heap(HeapError::InvalidRange {
                    address: array.location(),
                    len: 8,
                })),
                "index {index}"
            );
        }
    }

    #[test]
    fn wild_store_faults_instead_of_reaching_the_stack() {
        let mut b = ModuleBuilder::new();
        let long = b.primitive(PrimitiveKind::I64);
        let longs = b.array_of(long);
        let value = b.const_i64(-1);
        let wild = b.const_i64(1 << 60);
        let two = b.const_i32(2);
        let void = b.void();
        let mut m = static_main(&mut b, void);
        m.emit(Op::Ldc, value).emit(Op::Ldc, wild);
        m.emit(Op::Ldc, two).emit(Op::Newarr, longs as i32).op(Op::Stelem);
        m.op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let mut rt = runtime(b);
        let before = rt.stack.bytes(Address::stack(0), 64).unwrap().to_vec();
        let err = rt.invoke(InvocationRequest::new(main)).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            RuntimeError::Heap(HeapError::InvalidRange { len: 8, .. })
        ));
        assert_eq!(rt.stack.bytes(Address::stack(0), 64).unwrap(), &before[..]);
        assert_eq!(rt.stack.depth(), 1);
    }

    #[test]
    fn stind_then_ldind_reproduces_bytes() {
        let mut b = ModuleBuilder::new();
        let long = b.primitive(PrimitiveKind::I64);
        let pattern = b.const_i64(0x0102_0304_0506_0708);
        let mut m = static_main(&mut b, long);
        let x = m.local("x", long);
        m.emit(Op::Ldc, pattern);
        m.emit(Op::Ldtype, long as i32).emit(Op::Ldloca, x).emit(Op::Stind, long as i32);
        m.emit(Op::Ldtype, long as i32).emit(Op::Ldloca, x).emit(Op::Ldind, long as i32);
        m.op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(
            rt.read(value.location(), 8).unwrap(),
            &0x0102_0304_0506_0708i64.to_le_bytes()
        );
    }

    #[test]
    fn address_of_element_writes_through() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let two = b.const_i32(2);
        let zero = b.const_i32(0);
        let seven = b.const_i32(7);
        let mut m = static_main(&mut b, int);
        let a = m.local("a", ints);
        m.emit(Op::Ldc, two).emit(Op::Newarr, ints as i32).emit(Op::Stloc, a);
        m.emit(Op::Ldc, seven);
        m.emit(Op::Ldtype, int as i32).emit(Op::Ldc, zero).emit(Op::Ldloc, a).op(Op::Ldelema);
        m.emit(Op::Stind, int as i32);
        m.emit(Op::Ldc, zero).emit(Op::Ldloc, a).op(Op::Ldelem).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(7));
    }

    #[test]
    fn address_of_without_token_faults() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let one = b.const_i32(1);
        let mut m = static_main(&mut b, int);
        let x = m.local("x", int);
        m.emit(Op::Ldc, one).emit(Op::Ldloca, x).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (_, result) = run(b, main);
        assert_eq!(
            result.unwrap_err().root_cause(),
            &RuntimeError::MissingTypeToken { op: Op::Ldloca }
        );
    }

    #[test]
    fn address_of_a_temporary_releases_it_with_the_pointer() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let void = b.void();
        let cell = b.composite("Cell", TypeDefKind::Class);
        let v = b.field(cell, "v", int, false);
        let mut ctor = MethodBuilder::new(".ctor", cell, void);
        ctor.op(Op::Ret);
        let new_cell = b.add_constructor(ctor).unwrap();
        let zero = b.const_i32(0);
        let two = b.const_i32(2);
        let nine = b.const_i32(9);
        let program = b.static_class("Program");

        let mut field = MethodBuilder::new("field", program, int).set_static();
        field.emit(Op::Newobj, new_cell).emit(Op::Ldtype, int as i32).emit(Op::Ldflda, v);
        field.emit(Op::Ldind, int as i32).op(Op::Ret);
        let field = b.add_method(field).unwrap();

        let mut element = MethodBuilder::new("element", program, int).set_static();
        element.emit(Op::Ldtype, int as i32).emit(Op::Ldc, zero);
        element.emit(Op::Ldc, two).emit(Op::Newarr, ints as i32).op(Op::Ldelema);
        element.emit(Op::Ldind, int as i32).op(Op::Ret);
        let element = b.add_method(element).unwrap();

        let mut store = MethodBuilder::new("store", program, void).set_static();
        store.emit(Op::Ldc, nine);
        store.emit(Op::Newobj, new_cell).emit(Op::Ldtype, int as i32).emit(Op::Ldflda, v);
        store.emit(Op::Stind, int as i32).op(Op::Ret);
        let store = b.add_method(store).unwrap();

        let mut kept = MethodBuilder::new("kept", program, int).set_static();
        let c = kept.local("c", cell);
        kept.emit(Op::Newobj, new_cell).emit(Op::Stloc, c);
        kept.emit(Op::Ldc, nine);
        kept.emit(Op::Ldloc, c).emit(Op::Ldtype, int as i32).emit(Op::Ldflda, v);
        kept.emit(Op::Stind, int as i32);
        kept.emit(Op::Ldloc, c).emit(Op::Ldfld, v).op(Op::Ret);
        let kept = b.add_method(kept).unwrap();

        let mut rt = runtime(b);
        let baseline = rt.heap.stats().live_objects;
        for method in [field, element] {
            let value = rt.invoke(InvocationRequest::new(method)).unwrap().unwrap();
            assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(0));
            assert_eq!(rt.heap.stats().live_objects, baseline);
        }
        assert_eq!(rt.invoke(InvocationRequest::new(store)), Ok(None));
        assert_eq!(rt.heap.stats().live_objects, baseline);
        // the local keeps the instance alive while the pointer writes through
        let value = rt.invoke(InvocationRequest::new(kept)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(9));
        assert_eq!(rt.heap.stats().live_objects, baseline);
    }

    #[test]
    fn static_and_argument_addresses_write_through() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let one = b.const_i32(1);
        let five = b.const_i32(5);
        let forty = b.const_i32(40);
        let program = b.static_class("Program");
        let counter = b.field(program, "counter", int, true);

        let mut bump = MethodBuilder::new("bump", program, int).set_static();
        let n = bump.param("n", int);
        bump.emit(Op::Ldc, one);
        bump.emit(Op::Ldtype, int as i32).emit(Op::Ldarga, n).emit(Op::Ldind, int as i32);
        bump.op(Op::Add);
        bump.emit(Op::Ldtype, int as i32).emit(Op::Ldarga, n).emit(Op::Stind, int as i32);
        bump.emit(Op::Ldarg, n).op(Op::Ret);
        let bump = b.add_callable(bump).unwrap();

        let mut m = MethodBuilder::new("main", program, int).set_static();
        m.emit(Op::Ldc, five);
        m.emit(Op::Ldtype, int as i32).emit(Op::Ldsflda, counter).emit(Op::Stind, int as i32);
        m.emit(Op::Ldc, forty).emit(Op::Call, bump);
        m.emit(Op::Ldsfld, counter).op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(46));
    }

    #[test]
    fn starg_replaces_an_argument() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let string = b.string();
        let program = b.static_class("Program");
        let twenty_one = b.const_i32(21);
        let first = b.const_string("first");
        let second = b.const_string("second");

        let mut double = MethodBuilder::new("double", program, int).set_static();
        let n = double.param("n", int);
        double.emit(Op::Ldarg, n).emit(Op::Ldarg, n).op(Op::Add).emit(Op::Starg, n);
        double.emit(Op::Ldarg, n).op(Op::Ret);
        let double = b.add_callable(double).unwrap();

        let mut swap = MethodBuilder::new("swap", program, string).set_static();
        let s = swap.param("s", string);
        swap.emit(Op::Ldstr, second).emit(Op::Starg, s);
        swap.emit(Op::Ldarg, s).op(Op::Ret);
        let swap = b.add_callable(swap).unwrap();

        let mut numbers = MethodBuilder::new("numbers", program, int).set_static();
        numbers.emit(Op::Ldc, twenty_one).emit(Op::Call, double).op(Op::Ret);
        let numbers = b.add_method(numbers).unwrap();

        let mut text = MethodBuilder::new("text", program, string).set_static();
        text.emit(Op::Ldstr, first).emit(Op::Call, swap).op(Op::Ret);
        let text = b.add_method(text).unwrap();

        let mut rt = runtime(b);
        let value = rt.invoke(InvocationRequest::new(numbers)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(42));
        let value = rt.invoke(InvocationRequest::new(text)).unwrap().unwrap();
        assert_eq!(rt.read_string(value).unwrap(), "second");
        // "first" went away when the argument slot was overwritten
        assert_eq!(rt.heap.stats().live_objects, 1);
    }

    // ── Opcode families ───────────────────────────────────────────────

    #[test]
    fn default_values_are_zeroed() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let ints = b.array_of(int);
        let point = b.composite("Point", TypeDefKind::Struct);
        let fy = b.field(point, "y", int, false);
        let two = b.const_i32(2);
        let three = b.const_i32(3);
        let mut m = static_main(&mut b, int);
        m.emit(Op::Lddft, int as i32);
        m.emit(Op::Lddft, ints as i32).op(Op::Ldlen).op(Op::Add);
        m.emit(Op::Lddft, point as i32).emit(Op::Ldfld, fy).op(Op::Add);
        m.emit(Op::Ldc, two).emit(Op::Ldc, three).emit(Op::Newarr, ints as i32);
        m.op(Op::Ldelem).op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(0));
        // the empty and the fresh array were both temporaries
        assert_eq!(rt.heap.stats().live_objects, 0);
        assert_eq!(rt.heap.stats().allocations, 2);
    }

    #[test]
    fn negation_remainder_and_shifts() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let program = b.static_class("Program");
        let c = |b: &mut ModuleBuilder, v: i32| b.const_i32(v);
        let cases: Vec<(Vec<(Op, i32)>, i32)> = vec![
            (vec![(Op::Ldc, c(&mut b, 7)), (Op::Neg, 0)], -7),
            (vec![(Op::Ldc, c(&mut b, 17)), (Op::Ldc, c(&mut b, 5)), (Op::Mod, 0)], 2),
            (vec![(Op::Ldc, c(&mut b, -7)), (Op::Ldc, c(&mut b, 3)), (Op::Mod, 0)], -1),
            (vec![(Op::Ldc, c(&mut b, 1)), (Op::Ldc, c(&mut b, 4)), (Op::Shl, 0)], 16),
            (vec![(Op::Ldc, c(&mut b, -64)), (Op::Ldc, c(&mut b, 3)), (Op::Shr, 0)], -8),
            // shift counts wrap at the operand width
            (vec![(Op::Ldc, c(&mut b, 1)), (Op::Ldc, c(&mut b, 33)), (Op::Shl, 0)], 2),
        ];
        let mut methods = Vec::new();
        for (i, (body, expected)) in cases.into_iter().enumerate() {
            let mut m = MethodBuilder::new(&format!("case{i}"), program, int).set_static();
            for (op, operand) in body {
                m.emit(op, operand);
            }
            m.op(Op::Ret);
            methods.push((b.add_method(m).unwrap(), expected));
        }

        let mut rt = runtime(b);
        for (method, expected) in methods {
            let value = rt.invoke(InvocationRequest::new(method)).unwrap().unwrap();
            assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(expected), "method {method}");
        }
    }

    #[test]
    fn inequality_on_numbers_and_strings() {
        let mut b = ModuleBuilder::new();
        let bool_ty = b.bool();
        let program = b.static_class("Program");
        let three = b.const_i32(3);
        let four = b.const_i32(4);
        let word = b.const_string("same");
        let again = b.const_string("same");

        let mut numbers = MethodBuilder::new("numbers", program, bool_ty).set_static();
        numbers.emit(Op::Ldc, three).emit(Op::Ldc, four).op(Op::Cne).op(Op::Ret);
        let numbers = b.add_method(numbers).unwrap();

        let mut strings = MethodBuilder::new("strings", program, bool_ty).set_static();
        strings.emit(Op::Ldstr, word).emit(Op::Ldstr, again).op(Op::Cne).op(Op::Ret);
        let strings = b.add_method(strings).unwrap();

        let mut rt = runtime(b);
        let value = rt.invoke(InvocationRequest::new(numbers)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::Bool(true));
        let value = rt.invoke(InvocationRequest::new(strings)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::Bool(false));
        assert_eq!(rt.heap.stats().live_objects, 0);
    }

    // ── Objects and calls ─────────────────────────────────────────────

    #[test]
    fn struct_constructor_and_fields() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let void = b.void();
        let point = b.composite("Point", TypeDefKind::Struct);
        let fx = b.field(point, "x", int, false);
        let fy = b.field(point, "y", int, false);
        let mut ctor = MethodBuilder::new(".ctor", point, void);
        ctor.param("x", int);
        ctor.param("y", int);
        ctor.emit(Op::Ldarg, 0).op(Op::Ldthis).emit(Op::Stfld, fx);
        ctor.emit(Op::Ldarg, 1).op(Op::Ldthis).emit(Op::Stfld, fy);
        ctor.op(Op::Ret);
        let new_point = b.add_constructor(ctor).unwrap();
        let three = b.const_i32(3);
        let four = b.const_i32(4);

        let mut m = static_main(&mut b, int);
        let p = m.local("p", point);
        m.emit(Op::Ldc, three).emit(Op::Ldc, four).emit(Op::Newobj, new_point);
        m.emit(Op::Stloc, p);
        m.emit(Op::Ldloc, p).emit(Op::Ldfld, fx);
        m.emit(Op::Ldloc, p).emit(Op::Ldfld, fy);
        m.op(Op::Add).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(7));
    }

    #[test]
    fn class_instance_method_updates_state() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let void = b.void();
        let counter = b.composite("Counter", TypeDefKind::Class);
        let count = b.field(counter, "count", int, false);

        let mut ctor = MethodBuilder::new(".ctor", counter, void);
        ctor.op(Op::Ret);
        let new_counter = b.add_constructor(ctor).unwrap();

        let mut inc = MethodBuilder::new("inc", counter, int);
        inc.param("by", int);
        inc.op(Op::Ldthis).emit(Op::Ldfld, count).emit(Op::Ldarg, 0).op(Op::Add);
        inc.op(Op::Ldthis).emit(Op::Stfld, count);
        inc.op(Op::Ldthis).emit(Op::Ldfld, count).op(Op::Ret);
        let inc = b.add_callable(inc).unwrap();

        let five = b.const_i32(5);
        let two = b.const_i32(2);
        let mut m = static_main(&mut b, int);
        let c = m.local("c", counter);
        let r = m.local("r", int);
        m.emit(Op::Newobj, new_counter).emit(Op::Stloc, c);
        m.emit(Op::Ldc, five).emit(Op::Ldloc, c).emit(Op::Call, inc).emit(Op::Stloc, r);
        m.emit(Op::Ldc, two).emit(Op::Ldloc, c).emit(Op::Call, inc).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(7));
        // the counter was only held by main's local
        assert_eq!(rt.heap.stats().live_objects, 0);
    }

    #[test]
    fn recursive_factorial() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let program = b.static_class("Program");
        let one = b.const_i32(1);
        let five = b.const_i32(5);

        let mut fact = MethodBuilder::new("fact", program, int).set_static();
        let n = fact.param("n", int);
        let recurse = fact.label();
        fact.emit(Op::Ldarg, n).emit(Op::Ldc, one).op(Op::Cgt).brtrue(recurse);
        fact.emit(Op::Ldc, one).op(Op::Ret);
        fact.bind(recurse);
        fact.emit(Op::Ldarg, n);
        fact.emit(Op::Ldarg, n).emit(Op::Ldc, one).op(Op::Sub);
        // member ref index of `fact` itself is assigned below
        fact.emit(Op::Call, 0).op(Op::Mul).op(Op::Ret);
        let fact = b.add_callable(fact).unwrap();
        assert_eq!(fact, 0);

        let mut m = MethodBuilder::new("main", program, int).set_static();
        m.emit(Op::Ldc, five).emit(Op::Call, fact).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::I32(120));
    }

    /// A static method that calls itself without end.
    fn forever() -> (bytecode::Module, u32) {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let program = b.static_class("Program");
        let entry = b.module().methods.len() as u32;
        let mut forever = MethodBuilder::new("forever", program, void).set_static();
        // member ref 0 is `forever` itself
        forever.emit(Op::Call, 0).op(Op::Ret);
        assert_eq!(b.add_callable(forever).unwrap(), 0);
        (b.finish(), entry)
    }

    #[test]
    fn unbounded_recursion_hits_the_depth_limit() {
        let (module, entry) = forever();
        let settings = RuntimeSettings {
            max_call_depth: 16,
            ..RuntimeSettings::default()
        };
        let mut rt = Runtime::new(module, settings).unwrap();
        let err = rt.invoke(InvocationRequest::new(entry)).unwrap_err();
        assert_eq!(err.root_cause(), &RuntimeError::CallDepthExceeded { limit: 16 });
        assert_eq!(rt.stack.depth(), 1);
    }

    #[test]
    fn default_depth_limit_faults_before_the_native_stack_runs_out() {
        let handle = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let (module, entry) = forever();
                let mut rt = Runtime::new(module, RuntimeSettings::default()).unwrap();
                let err = rt.invoke(InvocationRequest::new(entry)).unwrap_err();
                (err.root_cause().clone(), rt.stack.depth())
            })
            .unwrap();
        let (cause, depth) = handle.join().unwrap();
        assert_eq!(
            cause,
            RuntimeError::CallDepthExceeded {
                limit: crate::MAX_CALL_DEPTH
            }
        );
        assert_eq!(depth, 1);
    }

    #[test]
    fn call_depth_counts_guest_frames_only() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let int = b.int();
        let program = b.static_class("Program");
        let one = b.const_i32(1);
        let entry = b.module().methods.len() as u32;
        let mut countdown = MethodBuilder::new("countdown", program, void).set_static();
        let n = countdown.param("n", int);
        let done = countdown.label();
        countdown.emit(Op::Ldarg, n).brfalse(done);
        countdown.emit(Op::Ldarg, n).emit(Op::Ldc, one).op(Op::Sub);
        countdown.emit(Op::Call, 0);
        countdown.bind(done);
        countdown.op(Op::Ret);
        assert_eq!(b.add_callable(countdown).unwrap(), 0);

        let settings = RuntimeSettings {
            max_call_depth: 3,
            ..RuntimeSettings::default()
        };
        let mut rt = Runtime::new(b.finish(), settings).unwrap();
        let countdown_from = |rt: &mut Runtime, start: i32| {
            let n = rt.allocate_scalar(Scalar::I32(start)).unwrap();
            rt.invoke(InvocationRequest::new(entry).with_arguments(vec![n]))
        };
        // countdown(2) -> (1) -> (0): exactly three guest frames
        assert_eq!(countdown_from(&mut rt, 2), Ok(None));
        let err = countdown_from(&mut rt, 3).unwrap_err();
        assert_eq!(err.root_cause(), &RuntimeError::CallDepthExceeded { limit: 3 });
    }

    // ── Strings, conversion, liveness ─────────────────────────────────

    #[test]
    fn concatenation_formats_numbers() {
        let mut b = ModuleBuilder::new();
        let string = b.string();
        let prefix = b.const_string("n=");
        let five = b.const_i32(5);
        let mut m = static_main(&mut b, string);
        m.emit(Op::Ldstr, prefix).emit(Op::Ldc, five).op(Op::Cnct).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_string(value).unwrap(), "n=5");
        // only the result is still alive
        assert_eq!(rt.heap.stats().live_objects, 1);
    }

    #[test]
    fn strings_compare_by_content() {
        let mut b = ModuleBuilder::new();
        let bool_ty = b.bool();
        let a = b.const_string("ab");
        let c = b.const_string("a");
        let d = b.const_string("b");
        let mut m = static_main(&mut b, bool_ty);
        m.emit(Op::Ldstr, a);
        m.emit(Op::Ldstr, c).emit(Op::Ldstr, d).op(Op::Add);
        m.op(Op::Ceq).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        assert_eq!(run_scalar(b, main), Scalar::Bool(true));
    }

    #[test]
    fn conv_to_string_and_reinterpret() {
        let mut b = ModuleBuilder::new();
        let string = b.string();
        let uint = b.primitive(PrimitiveKind::U32);
        let answer = b.const_i32(42);
        let minus_one = b.const_i32(-1);
        let program = b.static_class("Program");

        let mut text = MethodBuilder::new("text", program, string).set_static();
        text.emit(Op::Ldc, answer).emit(Op::Conv, string as i32).op(Op::Ret);
        let text = b.add_method(text).unwrap();

        let mut raw = MethodBuilder::new("raw", program, uint).set_static();
        raw.emit(Op::Ldc, minus_one).emit(Op::Conv, uint as i32).op(Op::Ret);
        let raw = b.add_method(raw).unwrap();

        let mut rt = runtime(b);
        let value = rt.invoke(InvocationRequest::new(text)).unwrap().unwrap();
        assert_eq!(rt.read_string(value).unwrap(), "42");
        let value = rt.invoke(InvocationRequest::new(raw)).unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::U32(u32::MAX));
    }

    #[test]
    fn locals_are_released_when_the_frame_exits() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let string = b.string();
        let hello = b.const_string("temp");
        let one = b.const_i32(1);
        let mut m = static_main(&mut b, int);
        let s = m.local("s", string);
        m.emit(Op::Ldstr, hello).emit(Op::Stloc, s);
        m.emit(Op::Ldc, one).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        assert!(result.is_ok());
        assert_eq!(rt.heap.stats().live_objects, 0);
        assert_eq!(rt.heap.stats().frees, 1);
    }

    #[test]
    fn overwritten_local_is_freed_and_detected() {
        let mut b = ModuleBuilder::new();
        let string = b.string();
        let first = b.const_string("first");
        let second = b.const_string("second");
        let mut m = static_main(&mut b, string);
        let s = m.local("s", string);
        m.emit(Op::Ldstr, first).emit(Op::Stloc, s);
        m.emit(Op::Ldstr, second).emit(Op::Stloc, s);
        m.emit(Op::Ldloc, s).op(Op::Ret);
        let main = b.add_method(m).unwrap();
        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_string(value).unwrap(), "second");
        let stats = rt.heap.stats();
        assert_eq!((stats.allocations, stats.frees), (2, 1));
        assert_eq!(rt.heap.live_objects().count(), 1);
    }

    #[test]
    fn clearing_the_host_frame_releases_results() {
        let mut b = ModuleBuilder::new();
        let string = b.string();
        let text = b.const_string("kept");
        let mut m = static_main(&mut b, string);
        m.emit(Op::Ldstr, text).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let mut rt = runtime(b);
        let value = rt.invoke(InvocationRequest::new(main)).unwrap().unwrap();
        rt.retain(value).unwrap();
        assert_eq!(rt.heap.stats().live_objects, 1);
        rt.clear_host_frame().unwrap();
        assert_eq!(rt.heap.stats().live_objects, 0);
        assert!(rt.stack.current().unwrap().values().is_empty());
    }

    #[test]
    fn use_after_free_is_distinct_from_unknown() {
        let mut b = ModuleBuilder::new();
        b.string();
        let mut rt = runtime(b);
        let s = rt.allocate_string("gone").unwrap();
        rt.deallocate_if_dead(s).unwrap();
        assert_eq!(
            rt.read_string(s),
            Err(RuntimeError::Heap(HeapError::UseAfterFree(s.location())))
        );
        let bogus = Value::String {
            ty: rt.types.builtins().string,
            target: object::Address::heap(4096),
        };
        assert_eq!(
            rt.read_string(bogus),
            Err(RuntimeError::Heap(HeapError::NotAllocated(bogus.location())))
        );
    }

    // ── Natives ───────────────────────────────────────────────────────

    #[test]
    fn native_print_reaches_the_output_sink() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let int = b.int();
        let string = b.string();
        let system = b.static_class("system");
        let mut print = MethodBuilder::new("Print", system, void).set_static().set_native();
        print.param("text", string);
        let print = b.add_callable(print).unwrap();
        let mut length = MethodBuilder::new("Length", system, int).set_static().set_native();
        length.param("text", string);
        let length = b.add_callable(length).unwrap();
        let hello = b.const_string("hello");

        let mut m = static_main(&mut b, int);
        m.emit(Op::Ldstr, hello).emit(Op::Call, print);
        m.emit(Op::Ldstr, hello).emit(Op::Call, length).op(Op::Ret);
        let main = b.add_method(m).unwrap();

        let (rt, result) = run(b, main);
        let value = result.unwrap().unwrap();
        assert_eq!(rt.read_scalar(value).unwrap(), Scalar::I32(5));
        assert_eq!(rt.output().lines(), vec!["hello".to_string()]);
        assert_eq!(rt.heap.stats().live_objects, 0);
    }

    #[test]
    fn unregistered_native_is_reported() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let io = b.static_class("io");
        let open = MethodBuilder::new("Open", io, void).set_static().set_native();
        let open = b.add_method(open).unwrap();
        let mut rt = runtime(b);
        assert_eq!(
            rt.invoke(InvocationRequest::new(open)),
            Err(RuntimeError::UnknownNative {
                type_name: "io".to_string(),
                method: "Open".to_string(),
            })
        );
    }
}
