//! Compilador de máquinas de estados.
//!
//! Recorre el cuerpo de cada unidad de corrutina en orden textual y
//! asigna identificadores crecientes a cada construcción que suspende
//! (`yield`, `wait_until` y `call`). El flujo de control estructurado
//! se aplana a saltos entre etiquetas, de forma que reingresar a la
//! unidad consista en despachar sobre su estado hacia la etiqueta de
//! reanudación correspondiente.
//!
//! Las locales `let` de las corrutinas no pueden vivir en la pila, ya
//! que su valor debe sobrevivir a las suspensiones. Antes de reducir se
//! elevan a variables estáticas de la unidad.

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    ir::{
        Instruction, Label, Point, PointKind, Program, Routine, StateWidth, SuspensionPoint, Unit,
        MAX_SUSPENSION_POINTS,
    },
    model::{Expr, Model, Owner, Place, StaticId, StaticVariable, Stmt, UnitId, Var},
    source::{Located, Location},
};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Coroutine `{unit}` exceeds the limit of {MAX_SUSPENSION_POINTS} suspension points")]
    SuspensionLimitExceeded { unit: String },
}

pub type Lowering<T> = Result<T, Located<MachineError>>;

/// Reduce un modelo completo a representación intermedia.
///
/// Los enlaces entre llamadores y subrutinas quedan vacíos, de ellos
/// se encarga [`crate::link`].
pub fn lower(mut model: Model) -> Lowering<Program> {
    let hoisted: Vec<Vec<StaticId>> = (0..model.units.len())
        .map(|unit| hoist(&mut model, UnitId(unit)))
        .collect();

    let units = hoisted
        .into_iter()
        .enumerate()
        .map(|(id, hoisted)| {
            let unit = &model.units[id];

            let mut cx = Context::new(&model, &hoisted, &unit.path);
            cx.block(&unit.body)?;
            cx.code.push(Instruction::Finish);

            let Context { points, code, .. } = cx;

            let width = StateWidth::for_points(points.len());
            trace!(unit = %unit.path, points = points.len(), ?width, "state machine built");

            Ok(Unit {
                points,
                code,
                width,
                hoisted,
            })
        })
        .collect::<Lowering<Vec<_>>>()?;

    let functions = model
        .functions
        .iter()
        .map(|function| routine(&model, &function.body))
        .collect::<Lowering<Vec<_>>>()?;

    let hooks = model
        .hooks
        .iter()
        .map(|hook| routine(&model, &hook.body))
        .collect::<Lowering<Vec<_>>>()?;

    let entry = routine(&model, &model.entry.body)?;

    debug!(
        units = units.len(),
        points = units.iter().map(|unit| unit.points.len()).sum::<usize>(),
        "coroutines lowered"
    );

    Ok(Program {
        model,
        units,
        functions,
        hooks,
        entry,
        frames: Vec::new(),
    })
}

/// Eleva las locales de una unidad a estáticas.
fn hoist(model: &mut Model, id: UnitId) -> Vec<StaticId> {
    let unit = &model.units[id.0];

    let hoisted: Vec<StaticVariable> = unit
        .locals
        .iter()
        .map(|local| StaticVariable {
            name: local.name.clone(),
            path: format!("{}.{}", unit.path, local.name),
            symbol: format!("{}__{}", unit.symbol, local.name),
            owner: Owner::Unit(id),
            typ: local.typ,
            length: local.length,
            volatile: false,
            initial: None,
            hint: local.hint.clone(),
            location: local.location.clone(),
        })
        .collect();

    let first = model.statics.len();
    model.statics.extend(hoisted);

    (first..model.statics.len()).map(StaticId).collect()
}

fn routine(model: &Model, body: &[Stmt]) -> Lowering<Routine> {
    let mut cx = Context::new(model, &[], "");
    cx.block(body)?;

    Ok(Routine { code: cx.code })
}

struct Context<'a> {
    model: &'a Model,
    hoisted: &'a [StaticId],
    unit: &'a str,
    code: Vec<Instruction>,
    points: Vec<SuspensionPoint>,
    next_label: u32,

    /// Destinos de `continue` y `break` del ciclo más interno.
    loops: Vec<(Label, Label)>,
}

impl<'a> Context<'a> {
    fn new(model: &'a Model, hoisted: &'a [StaticId], unit: &'a str) -> Self {
        Context {
            model,
            hoisted,
            unit,
            code: Vec::new(),
            points: Vec::new(),
            next_label: 0,
            loops: Vec::new(),
        }
    }

    fn block(&mut self, statements: &[Stmt]) -> Lowering<()> {
        statements
            .iter()
            .try_for_each(|statement| self.statement(statement))
    }

    fn statement(&mut self, statement: &Stmt) -> Lowering<()> {
        use Instruction::*;

        match statement {
            Stmt::Let { local, value } => {
                if let Some(value) = value {
                    let place = self.place(&Place {
                        var: Var::Local(*local),
                        index: None,
                    });

                    let value = self.expr(value);
                    self.code.push(Assign {
                        place,
                        op: None,
                        value,
                    });
                }
            }

            Stmt::Yield(location) => {
                let point = self.point(PointKind::Yield, location)?;
                self.code.extend([SetState(point), Suspend, Resume(point)]);
            }

            Stmt::WaitUntil {
                condition,
                hint,
                location,
            } => {
                let condition = self.expr(condition);
                let kind = PointKind::WaitUntil {
                    condition: condition.clone(),
                    hint: *hint,
                };

                let point = self.point(kind, location)?;
                self.code.extend([
                    SetState(point),
                    Resume(point),
                    ReturnUnless {
                        condition,
                        hint: *hint,
                    },
                ]);
            }

            Stmt::Call {
                callee,
                args,
                location,
            } => {
                // Los argumentos se asignan solo en la llamada fresca,
                // el reingreso salta directamente a la reanudación
                let model = self.model;
                let parameters = &model.unit(*callee).parameters;
                for (&parameter, arg) in parameters.iter().zip(args) {
                    let value = self.expr(arg);
                    self.code.push(Assign {
                        place: Place {
                            var: Var::Static(parameter),
                            index: None,
                        },
                        op: None,
                        value,
                    });
                }

                let point = self.point(PointKind::Call(*callee), location)?;
                self.code
                    .extend([SetState(point), Resume(point), Drive(*callee)]);
            }

            Stmt::If {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.expr(condition);
                let on_false = self.label();

                self.code.push(JumpIfFalse(condition, on_false));
                self.block(then)?;

                if otherwise.is_empty() {
                    self.code.push(SetLabel(on_false));
                } else {
                    let end = self.label();
                    self.code.extend([Jump(end), SetLabel(on_false)]);
                    self.block(otherwise)?;
                    self.code.push(SetLabel(end));
                }
            }

            Stmt::While { condition, body } => {
                let (head, end) = (self.label(), self.label());
                let condition = self.expr(condition);

                self.code.extend([SetLabel(head), JumpIfFalse(condition, end)]);
                self.looping(head, end, body)?;
                self.code.extend([Jump(head), SetLabel(end)]);
            }

            Stmt::Loop(body) => {
                let (head, end) = (self.label(), self.label());

                self.code.push(SetLabel(head));
                self.looping(head, end, body)?;
                self.code.push(Jump(head));

                // Sin `break`, la salida del ciclo es inalcanzable
                if self.code.contains(&Jump(end)) {
                    self.code.push(SetLabel(end));
                }
            }

            Stmt::Break => {
                if let Some(&(_, end)) = self.loops.last() {
                    self.code.push(Jump(end));
                }
            }

            Stmt::Continue => {
                if let Some(&(head, _)) = self.loops.last() {
                    self.code.push(Jump(head));
                }
            }

            // Retornar desde una corrutina equivale a llegar al final
            Stmt::Return(None) if !self.unit.is_empty() => self.code.push(Finish),

            Stmt::Return(value) => {
                let value = value.as_ref().map(|value| self.expr(value));
                self.code.push(Return(value));
            }

            Stmt::Assign { place, op, value } => {
                let place = self.place(place);
                let value = self.expr(value);

                self.code.push(Assign {
                    place,
                    op: *op,
                    value,
                });
            }

            Stmt::Eval(expr) => {
                let expr = self.expr(expr);
                self.code.push(Eval(expr));
            }
        }

        Ok(())
    }

    fn looping(&mut self, head: Label, end: Label, body: &[Stmt]) -> Lowering<()> {
        self.loops.push((head, end));
        let result = self.block(body);
        self.loops.pop();

        result
    }

    fn point(&mut self, kind: PointKind, location: &Location) -> Lowering<Point> {
        if self.points.len() >= MAX_SUSPENSION_POINTS {
            let error = MachineError::SuspensionLimitExceeded {
                unit: self.unit.to_owned(),
            };

            return Err(Located::at(error, location.clone()));
        }

        let id = Point(self.points.len() as u16);
        self.points.push(SuspensionPoint {
            id,
            kind,
            location: location.clone(),
        });

        Ok(id)
    }

    fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;

        label
    }

    /// Sustituye locales elevadas por sus estáticas.
    fn place(&self, place: &Place) -> Place {
        let var = match place.var {
            Var::Local(local) if !self.hoisted.is_empty() => Var::Static(self.hoisted[local.0]),
            var => var,
        };

        Place {
            var,
            index: place.index.as_ref().map(|index| Box::new(self.expr(index))),
        }
    }

    fn expr(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::Const(value) => Expr::Const(*value),
            Expr::Read(place) => Expr::Read(self.place(place)),
            Expr::Call(callee, args) => {
                Expr::Call(*callee, args.iter().map(|arg| self.expr(arg)).collect())
            }

            Expr::Unary(op, operand) => Expr::Unary(*op, Box::new(self.expr(operand))),
            Expr::Binary(lhs, op, rhs) => {
                Expr::Binary(Box::new(self.expr(lhs)), *op, Box::new(self.expr(rhs)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir::BYTE_POINTS, pipeline};

    fn lowered(text: &str) -> Lowering<Program> {
        let resolved = pipeline::frontend(text).unwrap();
        lower(resolved.model)
    }

    fn yields(count: usize) -> String {
        format!("thread t {{ {} }} main {{ }}", "yield; ".repeat(count))
    }

    #[test]
    fn points_are_numbered_in_textual_order() {
        let program = lowered(
            "extern volatile u8 ready;
             thread t {
                 sub s { yield; }
                 yield;
                 wait_until ready;
                 call s;
             }
             main { }",
        )
        .unwrap();

        let t = program.unit(program.model.find_unit("t").unwrap());
        let kinds: Vec<_> = t.points.iter().map(|point| (point.id, &point.kind)).collect();

        assert!(matches!(
            kinds.as_slice(),
            [
                (Point(0), PointKind::Yield),
                (Point(1), PointKind::WaitUntil { .. }),
                (Point(2), PointKind::Call(_))
            ]
        ));

        assert_eq!(t.code.last(), Some(&Instruction::Finish));
        assert_eq!(t.width, StateWidth::Byte);
    }

    #[test]
    fn coroutine_locals_become_statics() {
        let program = lowered("thread t { let u8 n = 3; yield; n += 1; } main { let u8 m = 1; }").unwrap();

        let model = &program.model;
        let n = model.find_static("t.n").unwrap();
        assert_eq!(model.static_var(n).symbol, "t__n");

        let t = program.unit(model.find_unit("t").unwrap());
        assert_eq!(t.hoisted, vec![n]);
        assert!(matches!(
            &t.code[0],
            Instruction::Assign {
                place: Place { var: Var::Static(id), .. },
                ..
            } if *id == n
        ));

        // Las locales de main siguen siendo locales
        assert!(model.find_static("main.m").is_none());
        assert!(matches!(
            &program.entry.code[0],
            Instruction::Assign {
                place: Place { var: Var::Local(_), .. },
                ..
            }
        ));
    }

    #[test]
    fn every_label_is_a_jump_target() {
        let program = lowered(
            "extern volatile u8 ready;
             thread t {
                 if ready { yield; }
                 if ready { yield; } else { ready = 1; }
                 loop { yield; }
             }
             thread u {
                 loop { if ready { break; } yield; }
             }
             main { }",
        )
        .unwrap();

        for unit in &program.units {
            let targets: Vec<Label> = unit
                .code
                .iter()
                .filter_map(|instruction| match instruction {
                    Instruction::Jump(label) | Instruction::JumpIfFalse(_, label) => Some(*label),
                    _ => None,
                })
                .collect();

            for instruction in &unit.code {
                if let Instruction::SetLabel(label) = instruction {
                    assert!(targets.contains(label), "{:?}", unit.code);
                }
            }
        }

        // La salida del ciclo de `u` sí se alcanza mediante `break`
        let u = program.unit(program.model.find_unit("u").unwrap());
        let labels = u.code.iter().filter(|i| matches!(i, Instruction::SetLabel(_))).count();
        assert_eq!(labels, 3);
    }

    #[test]
    fn width_grows_past_one_byte() {
        let program = lowered(&yields(BYTE_POINTS)).unwrap();
        assert_eq!(program.units[0].width, StateWidth::Byte);

        let program = lowered(&yields(BYTE_POINTS + 1)).unwrap();
        assert_eq!(program.units[0].width, StateWidth::Word);
    }

    #[test]
    fn suspension_limit() {
        let program = lowered(&yields(MAX_SUSPENSION_POINTS)).unwrap();
        assert_eq!(program.units[0].points.len(), MAX_SUSPENSION_POINTS);

        let error = lowered(&yields(MAX_SUSPENSION_POINTS + 1)).err().unwrap();
        assert!(matches!(
            error.as_ref(),
            MachineError::SuspensionLimitExceeded { unit } if unit == "t"
        ));
    }
}
