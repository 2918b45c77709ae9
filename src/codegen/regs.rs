//! Asignación consultiva de registros.
//!
//! Cada sugerencia `use_reg` se intenta satisfacer enlazando la
//! variable a registros físicos fijos. Una sugerencia que no puede
//! cumplirse nunca es un error: la variable simplemente se queda en
//! almacenamiento ordinario y se emite una advertencia. El programa
//! generado debe comportarse igual con o sin estos enlaces.
//!
//! Las sugerencias con registro explícito se atienden primero, en el
//! orden en que aparecen en el código fuente, y luego las de clase
//! (`low`, `high`, `any`) sobre los registros que queden libres. Los
//! valores de varios bytes ocupan registros consecutivos a partir de
//! uno par, como lo exige avr-gcc.

use indexmap::IndexMap;
use std::marker::PhantomData;
use tracing::{debug, trace};

use crate::{
    arch::{Register, Target},
    error::Warning,
    ir::Program,
    model::{RegisterClass, RegisterHint, StaticId, UnitId},
    source::Located,
};

/// Almacenamiento al que puede enlazarse un registro.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Storage {
    Static(StaticId),

    /// Variable de estado de una unidad de corrutina.
    State(UnitId),
}

/// Enlace concreto de un almacenamiento a registros.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Nombre del primer registro, como se escribe en `asm("...")`.
    pub register: String,

    /// Banderas `-ffixed-*` de todos los registros ocupados.
    pub fixed: Vec<String>,
}

/// Resultado de la asignación.
#[derive(Debug, Default)]
pub struct Plan {
    bindings: IndexMap<Storage, Binding>,

    /// Banderas de registros fijos en orden ascendente de registro.
    fixed: Vec<String>,
}

impl Plan {
    pub fn binding(&self, storage: Storage) -> Option<&Binding> {
        self.bindings.get(&storage)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (Storage, &Binding)> {
        self.bindings.iter().map(|(storage, binding)| (*storage, binding))
    }

    pub fn fixed_flags(&self) -> &[String] {
        &self.fixed
    }
}

struct Request<'p> {
    storage: Storage,
    path: String,
    bytes: u32,
    unbindable: bool,
    hint: &'p RegisterHint,
}

/// Asigna registros según las sugerencias del programa.
pub fn allocate<T: Target>(program: &Program) -> (Plan, Vec<Located<Warning>>) {
    let file = T::Register::FILE;
    if file.is_empty() {
        debug!(target = T::NAME, "no bindable registers, register hints degrade");
        return (Plan::default(), Vec::new());
    }

    let model = &program.model;
    let statics = model
        .statics
        .iter()
        .enumerate()
        .filter_map(|(id, var)| {
            var.hint.as_ref().map(|hint| Request {
                storage: Storage::Static(StaticId(id)),
                path: var.path.clone(),
                bytes: var.typ.bytes(),
                unbindable: var.volatile || var.length.is_some(),
                hint,
            })
        });

    let states = model.units.iter().enumerate().filter_map(|(id, unit)| {
        unit.state_hint.as_ref().map(|hint| Request {
            storage: Storage::State(UnitId(id)),
            path: format!("{}.state", unit.path),
            bytes: program.units[id].width.bytes(),
            unbindable: false,
            hint,
        })
    });

    let mut requests: Vec<Request> = statics.chain(states).collect();
    requests.sort_by_key(|request| {
        let start = request.hint.location.start();
        (start.line(), start.column())
    });

    let mut allocator = Allocator::<T::Register> {
        owners: vec![None; file.len()],
        warnings: Vec::new(),
        bindings: IndexMap::new(),
        file: PhantomData,
    };

    let (exact, classes): (Vec<_>, Vec<_>) = requests
        .iter()
        .partition(|request| matches!(request.hint.class, RegisterClass::Exact(_)));

    for request in exact.into_iter().chain(classes) {
        allocator.request::<T>(request);
    }

    let mut taken: Vec<(u8, String)> = allocator
        .owners
        .iter()
        .zip(file)
        .filter(|(owner, _)| owner.is_some())
        .map(|(_, reg)| (reg.number(), T::fixed_flag(*reg)))
        .collect();

    taken.sort_by_key(|(number, _)| *number);

    let plan = Plan {
        bindings: allocator.bindings,
        fixed: taken.into_iter().map(|(_, flag)| flag).collect(),
    };

    debug!(bound = plan.bindings.len(), "registers allocated");
    (plan, allocator.warnings)
}

struct Allocator<R: Register> {
    /// Dueño de cada registro de `R::FILE`, por ruta.
    owners: Vec<Option<String>>,
    warnings: Vec<Located<Warning>>,
    bindings: IndexMap<Storage, Binding>,
    file: PhantomData<R>,
}

impl<R: Register> Allocator<R> {
    fn request<T: Target<Register = R>>(&mut self, request: &Request) {
        let path = &request.path;

        let span = if request.unbindable {
            Err(Warning::UnbindableStorage(path.clone()))
        } else {
            match request.hint.class {
                RegisterClass::Exact(number) => self.exact(number, request.bytes, path),
                class => self.pooled(class, request.bytes).ok_or_else(|| {
                    Warning::RegisterPoolExhausted {
                        path: path.clone(),
                        class,
                    }
                }),
            }
        };

        let span = match span {
            Ok(span) => span,
            Err(warning) => {
                trace!(%path, "register hint degrades to ordinary storage");

                let location = request.hint.location.clone();
                self.warnings.push(Located::at(warning, location));
                return;
            }
        };

        for &slot in &span {
            self.owners[slot] = Some(path.clone());
        }

        let binding = Binding {
            register: R::FILE[span[0]].to_string(),
            fixed: span.iter().map(|&slot| T::fixed_flag(R::FILE[slot])).collect(),
        };

        trace!(%path, register = %binding.register, "register bound");
        self.bindings.insert(request.storage, binding);
    }

    /// Posiciones en `R::FILE` de un registro explícito y sus sucesores.
    fn exact(&self, number: u8, bytes: u32, path: &str) -> Result<Vec<usize>, Warning> {
        let register = RegisterClass::Exact(number).to_string();

        let span = self.span(number, bytes).ok_or_else(|| Warning::RegisterUnavailable {
            path: path.to_owned(),
            register: register.clone(),
        })?;

        match span.iter().find_map(|&slot| self.owners[slot].clone()) {
            None => Ok(span),
            Some(owner) => Err(Warning::ConflictingRegisterHint {
                path: path.to_owned(),
                register,
                owner,
            }),
        }
    }

    /// Primer tramo libre de registros de una clase.
    fn pooled(&self, class: RegisterClass, bytes: u32) -> Option<Vec<usize>> {
        R::FILE.iter().find_map(|reg| {
            let span = self.span(reg.number(), bytes)?;
            let fits = span.iter().all(|&slot| {
                let reg = R::FILE[slot];
                let in_class = match class {
                    RegisterClass::Low => reg.is_low(),
                    RegisterClass::High => !reg.is_low(),
                    RegisterClass::Any | RegisterClass::Exact(_) => true,
                };

                in_class && self.owners[slot].is_none()
            });

            Some(span).filter(|_| fits)
        })
    }

    /// Registros consecutivos a partir de `first`, si todos existen.
    fn span(&self, first: u8, bytes: u32) -> Option<Vec<usize>> {
        if bytes > 1 && first % 2 != 0 {
            return None;
        }

        (0..bytes)
            .map(|offset| {
                let number = first.checked_add(offset as u8)?;
                R::FILE.iter().position(|reg| reg.number() == number)
            })
            .collect()
    }
}
