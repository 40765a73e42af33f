// a transparent packet-altering stream editor. it accepts tcp connections or
// udp datagrams on a local port, forwards them to a fixed remote or to each
// flow's original pre-NAT destination, and runs every payload chunk in both
// directions through an ordered list of `s/from/to[/count]` byte
// substitution rules, with the counts burning down per connection
// rules match within one read only, the editor does no reassembly and no
// protocol interpretation

pub mod dispatch;
pub mod endpoint;
pub mod event;
pub mod net;
pub mod rule;
