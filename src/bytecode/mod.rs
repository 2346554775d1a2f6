pub mod assemble;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod iseq;
pub mod op;
pub mod optimize;
pub mod options;
pub mod oracle;
pub mod params;
pub mod stack_check;

pub use compile::{compile, compile_node_tree};
pub use compile_error::{CompileError, Error, InternalError};
pub use iseq::{InstructionSequence, IseqKind};
pub use options::CompileOptions;
pub use oracle::{RedefinitionOracle, StaticOracle};
