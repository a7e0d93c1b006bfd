use std::error::Error;

use tactus::midi::print_ports;

fn main() -> Result<(), Box<dyn Error>> {
    print_ports()
}
