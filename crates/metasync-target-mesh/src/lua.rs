//! Lua source for the gateway's forwarded-for filter
//!
//! The generated script trusts the forwarded-for header only when the
//! connection's direct peer falls inside one of the managed prefixes. In
//! that case the left-most header entry is exposed as `x-real-ip` and the
//! peer address is kept in `x-envoy-original-remote-address`.
//!
//! Matching is done on parsed address bytes, for both IPv4 and IPv6
//! (IPv4-mapped IPv6 peers match IPv4 prefixes).

const TEMPLATE: &str = r#"
local trusted_cidrs = { __TRUSTED_CIDRS__ }

local function parse_ipv4(s)
  if s == nil then return nil end
  local a, b, c, d = s:match("^(%d+)%.(%d+)%.(%d+)%.(%d+)$")
  if a == nil then return nil end
  local bytes = { tonumber(a), tonumber(b), tonumber(c), tonumber(d) }
  for i = 1, 4 do
    if bytes[i] > 255 then return nil end
  end
  return bytes
end

local function hex_groups(part)
  local out = {}
  if part == "" then return out end
  for g in (part .. ":"):gmatch("([^:]*):") do
    if not g:match("^%x%x?%x?%x?$") then return nil end
    out[#out + 1] = tonumber(g, 16)
  end
  return out
end

local function parse_ipv6(s)
  local tail = nil
  local head, v4 = s:match("^(.*:)(%d+%.%d+%.%d+%.%d+)$")
  if head ~= nil then
    tail = parse_ipv4(v4)
    if tail == nil then return nil end
    s = head .. "0:0"
  end

  local left, right = s, ""
  local gap = s:find("::", 1, true)
  if gap ~= nil then
    left = s:sub(1, gap - 1)
    right = s:sub(gap + 2)
  end

  local lg = hex_groups(left)
  local rg = hex_groups(right)
  if lg == nil or rg == nil then return nil end

  local missing = 8 - #lg - #rg
  if gap ~= nil and missing < 1 then return nil end
  if gap == nil and missing ~= 0 then return nil end

  local groups = {}
  for _, g in ipairs(lg) do groups[#groups + 1] = g end
  for _ = 1, missing do groups[#groups + 1] = 0 end
  for _, g in ipairs(rg) do groups[#groups + 1] = g end

  local bytes = {}
  for _, g in ipairs(groups) do
    bytes[#bytes + 1] = math.floor(g / 256)
    bytes[#bytes + 1] = g % 256
  end
  if tail ~= nil then
    for i = 1, 4 do bytes[12 + i] = tail[i] end
  end
  return bytes
end

local function parse_addr(s)
  if s == nil then return nil end
  s = s:match("^%s*(.-)%s*$")
  local bracketed = s:match("^%[([^%]]+)%]")
  if bracketed ~= nil then return parse_ipv6(bracketed) end
  local _, colons = s:gsub(":", "")
  if colons == 0 then return parse_ipv4(s) end
  if colons == 1 then return parse_ipv4(s:match("^([^:]+)")) end
  return parse_ipv6(s)
end

local function unmap(bytes)
  if #bytes ~= 16 then return bytes end
  for i = 1, 10 do
    if bytes[i] ~= 0 then return bytes end
  end
  if bytes[11] ~= 255 or bytes[12] ~= 255 then return bytes end
  return { bytes[13], bytes[14], bytes[15], bytes[16] }
end

local function in_prefix(addr, net, bits)
  if #addr ~= #net then return false end
  local full = math.floor(bits / 8)
  for i = 1, full do
    if addr[i] ~= net[i] then return false end
  end
  local rem = bits % 8
  if rem == 0 then return true end
  local div = 2 ^ (8 - rem)
  return math.floor(addr[full + 1] / div) == math.floor(net[full + 1] / div)
end

local networks = {}
for _, cidr in ipairs(trusted_cidrs) do
  local addr, bits = cidr:match("^(.+)/(%d+)$")
  local net = parse_addr(addr)
  if net ~= nil then
    networks[#networks + 1] = { net = net, bits = tonumber(bits) }
  end
end

local function is_trusted(source)
  local addr = parse_addr(source)
  if addr == nil then return false end
  addr = unmap(addr)
  for _, n in ipairs(networks) do
    if in_prefix(addr, n.net, n.bits) then return true end
  end
  return false
end

function envoy_on_request(request_handle)
  local header = request_handle:headers():get("__HEADER_NAME__")
  if header == nil then return end

  local source = request_handle:streamInfo():downstreamDirectRemoteAddress()
  if source == nil or not is_trusted(source) then return end

  local first = header:match("^([^,]*)")
  local client = first and first:match("^%s*(.-)%s*$")
  if client == nil or client == "" then return end

  request_handle:headers():replace("x-envoy-original-remote-address", source)
  request_handle:headers():replace("x-real-ip", client)
end
"#;

/// Render the filter script for a header and trusted prefix list
///
/// CIDRs must already be validated prefixes and the header a plain token
/// name; neither is escaped.
pub fn generate(header_name: &str, cidrs: &[String]) -> String {
    let trusted = cidrs
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    TEMPLATE
        .replace("__TRUSTED_CIDRS__", &trusted)
        .replace("__HEADER_NAME__", header_name)
}

/// Whether `name` can be embedded in the script as a header name
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
