use arbitrary_int::u6;
use stm32h7xx_hal::time::MegaHertz;

/// The core clock.
pub const SYSCLK: MegaHertz = MegaHertz::MHz(400);

/// The AHB clock. The sample port kernel clock is derived from it.
pub const HCLK: MegaHertz = MegaHertz::MHz(200);

/// Initial sample port clock. Replaced by the configured divider before capture starts.
pub const SAMPLE_PORT_FREQUENCY: MegaHertz = MegaHertz::MHz(100);

/// The number of capture buffers.
pub const BUFFER_COUNT: usize = 16;

/// The size of each capture buffer in bytes.
// One buffer is one bulk transfer to the host. 4 KiB take 64 full speed packets.
pub const BUFFER_SIZE: usize = 4096;

/// Bytes moved by the MDMA per sample port FIFO threshold event.
// The QUADSPI FIFO holds 32 bytes. Half of it leaves room for the port to keep clocking while the
// MDMA drains the FIFO.
pub const REQUEST_LEN: u8 = 16;

/// MDMA request line of the QUADSPI FIFO threshold flag.
pub const QUADSPI_FIFO_TRIGGER: u6 = u6::new(22);

/// The MDMA channel running the capture descriptor list.
pub const MDMA_CHANNEL: usize = 0;

/// Bulk endpoint packet size. The internal PHY of USB2 only supports full speed.
pub const USB_PACKET_SIZE: u16 = 64;
