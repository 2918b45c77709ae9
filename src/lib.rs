//! Compilador de corrutinas cooperativas sin pila.
//!
//! Una descripción de hilos, subrutinas y hooks se traduce a C plano
//! para microcontroladores sin sistema operativo. Cada corrutina se
//! convierte en una máquina de estados cuya única memoria persistente
//! es una variable de estado de 8 o 16 bits, y un ciclo `main()`
//! generado reparte el procesador entre todas ellas.
//!
//! # Front end
//! El archivo de entrada se somete a análisis léxico en [`lex`] y
//! sintáctico en [`parse`]. El AST resultante es resuelto por
//! [`semantic`] a un modelo de declaraciones, descrito en [`model`],
//! donde cada entidad tiene nombre único, dueño y sugerencias de
//! afinación ya validadas.
//!
//! # Middle end
//! [`machine`] reduce cada cuerpo a la representación de [`ir`]:
//! código lineal con puntos de suspensión numerados. [`link`] valida el
//! grafo de llamadas entre subrutinas y registra cada sitio de llamada.
//!
//! # Back end
//! [`codegen`] asigna registros según las sugerencias, deriva las
//! banderas del compilador nativo y emite C para alguna de las
//! arquitecturas en [`arch`]. [`pipeline`] encadena todas las fases y
//! [`sim`] ejecuta el programa reducido sin hardware.

#[macro_use]
mod macros;

pub mod arch;
pub mod codegen;
pub mod error;
pub mod ir;
pub mod lex;
pub mod link;
pub mod machine;
pub mod model;
pub mod parse;
pub mod pipeline;
pub mod semantic;
pub mod sim;
pub mod source;
