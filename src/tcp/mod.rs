mod ioutil;
mod listen;
mod stream;
mod tcb;

pub use ioutil::*;
pub use listen::*;
pub use stream::*;
pub use tcb::*;
